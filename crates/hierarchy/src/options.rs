use std::time::Duration;

use datamover_transfer::TransferError;
use serde::{Deserialize, Serialize};

/// Tunables for walking and mirroring a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyOptions {
    /// Directories listed at the same time.
    #[serde(default = "default_listing_concurrency")]
    pub listing_concurrency: usize,

    /// Page size hint for endpoints that page their listings.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Replace existing destination files; when false they are skipped.
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,

    /// Period of journal saves while blocks are moving.
    #[serde(default = "default_journal_interval_ms")]
    pub journal_interval_ms: u64,

    /// Jobs buffered between the walkers and the scheduler.
    #[serde(default = "default_job_queue_depth")]
    pub job_queue_depth: usize,
}

fn default_listing_concurrency() -> usize {
    4
}

fn default_page_size() -> usize {
    1000
}

fn default_overwrite() -> bool {
    true
}

fn default_journal_interval_ms() -> u64 {
    1000
}

fn default_job_queue_depth() -> usize {
    256
}

impl Default for HierarchyOptions {
    fn default() -> Self {
        Self {
            listing_concurrency: default_listing_concurrency(),
            page_size: default_page_size(),
            overwrite: default_overwrite(),
            journal_interval_ms: default_journal_interval_ms(),
            job_queue_depth: default_job_queue_depth(),
        }
    }
}

impl HierarchyOptions {
    pub fn journal_interval(&self) -> Duration {
        Duration::from_millis(self.journal_interval_ms)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.listing_concurrency == 0 {
            return Err(TransferError::InvalidConfig(
                "listing_concurrency must be > 0".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(TransferError::InvalidConfig("page_size must be > 0".into()));
        }
        if self.journal_interval_ms == 0 {
            return Err(TransferError::InvalidConfig(
                "journal_interval_ms must be > 0".into(),
            ));
        }
        if self.job_queue_depth == 0 {
            return Err(TransferError::InvalidConfig(
                "job_queue_depth must be > 0".into(),
            ));
        }
        Ok(())
    }
}
