//! Persistence of hierarchy transfer state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use datamover_transfer::{BoxFuture, CheckpointSnapshot, TransferError, TransferProgress};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::enumerator::ContinuationToken;

/// Everything needed to resume a hierarchy transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchySnapshot {
    /// Directories still being listed, keyed by relative path, with the
    /// cursor after the last registered entry (`None`: not started).
    #[serde(default)]
    pub directories: BTreeMap<String, Option<ContinuationToken>>,
    /// Object checkpoints of jobs in flight, failed or cancelled.
    #[serde(default)]
    pub jobs: BTreeMap<String, CheckpointSnapshot>,
    #[serde(default)]
    pub progress: TransferProgress,
}

impl HierarchySnapshot {
    /// Nothing left to list and no job to resume.
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.jobs.is_empty()
    }
}

/// Durable store for [`HierarchySnapshot`]s.
pub trait Journal: Send + Sync {
    /// Returns the last saved snapshot, if any.
    fn load(&self) -> BoxFuture<'_, Result<Option<HierarchySnapshot>, TransferError>>;

    fn save<'a>(&'a self, snapshot: &'a HierarchySnapshot) -> BoxFuture<'a, Result<(), TransferError>>;
}

/// JSON file journal. Saves go to a sibling temporary file that is then
/// renamed over the journal, so a crash never leaves a torn snapshot.
#[derive(Debug, Clone)]
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Journal for FileJournal {
    fn load(&self) -> BoxFuture<'_, Result<Option<HierarchySnapshot>, TransferError>> {
        Box::pin(async move {
            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let snapshot = serde_json::from_str(&content)?;
            debug!(path = %self.path.display(), "loaded journal");
            Ok(Some(snapshot))
        })
    }

    fn save<'a>(&'a self, snapshot: &'a HierarchySnapshot) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let content = serde_json::to_string_pretty(snapshot)?;
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = self.temp_path();
            tokio::fs::write(&tmp, content).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
            Ok(())
        })
    }
}

/// Keeps the latest snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    latest: Mutex<Option<HierarchySnapshot>>,
    saves: Mutex<usize>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a previously saved snapshot.
    pub fn with_snapshot(snapshot: HierarchySnapshot) -> Self {
        Self {
            latest: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    pub fn latest(&self) -> Option<HierarchySnapshot> {
        self.latest.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

impl Journal for MemoryJournal {
    fn load(&self) -> BoxFuture<'_, Result<Option<HierarchySnapshot>, TransferError>> {
        Box::pin(async move { Ok(self.latest()) })
    }

    fn save<'a>(&'a self, snapshot: &'a HierarchySnapshot) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            *self.latest.lock().unwrap() = Some(snapshot.clone());
            *self.saves.lock().unwrap() += 1;
            Ok(())
        })
    }
}
