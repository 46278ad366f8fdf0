//! One directory level of a hierarchy transfer.

use datamover_transfer::{Location, TransferError};
use tokio_util::sync::CancellationToken;

use crate::destination::ensure_directory;
use crate::enumerator::{ContinuationToken, EnumerationEntry, HierarchyEnumerator};

/// Lists one source directory and mirrors it at the destination.
///
/// The owner drives [`next_entry`](Self::next_entry), registers each
/// entry, then persists [`cursor`](Self::cursor).
pub struct SubDirectoryTransfer {
    relative_path: String,
    source: Location,
    destination: Location,
    enumerator: HierarchyEnumerator,
}

impl SubDirectoryTransfer {
    /// `relative_path` is `""` for the hierarchy root.
    pub fn new(
        relative_path: impl Into<String>,
        source_root: &Location,
        destination_root: &Location,
        resume: Option<ContinuationToken>,
    ) -> Result<Self, TransferError> {
        let relative_path = relative_path.into();
        let source = source_root.child_directory(&relative_path)?;
        let destination = destination_root.child_directory(&relative_path)?;
        let Location::RemoteDirectory { endpoint, path } = &source else {
            return Err(TransferError::UnsupportedLocation(format!(
                "source {} is not a remote directory",
                source.display()
            )));
        };
        let enumerator = HierarchyEnumerator::new(
            endpoint.directories.clone(),
            path.clone(),
            relative_path.clone(),
            resume,
        );
        Ok(Self {
            relative_path,
            source,
            destination,
            enumerator,
        })
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn source(&self) -> &Location {
        &self.source
    }

    pub fn destination(&self) -> &Location {
        &self.destination
    }

    /// Creates this level's destination directory; returns how many
    /// directories had to be created.
    pub async fn create_destination_directory(
        &self,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        ensure_directory(&self.destination, cancel).await
    }

    pub async fn next_entry(&mut self, cancel: &CancellationToken) -> Option<EnumerationEntry> {
        self.enumerator.next(cancel).await
    }

    pub fn cursor(&self) -> ContinuationToken {
        self.enumerator.cursor()
    }
}
