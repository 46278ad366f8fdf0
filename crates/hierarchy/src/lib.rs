//! Resumable transfer of whole directory trees.
//!
//! Each directory level is listed lazily by a [`HierarchyEnumerator`].
//! Discovered files become [`TransferJob`](datamover_transfer::TransferJob)s
//! for the chunked-transfer scheduler; discovered subdirectories are
//! queued for listing. Listing cursors and object checkpoints go to a
//! [`Journal`] after every registered entry.

mod destination;
mod enumerator;
mod journal;
mod options;
mod subdir;
mod transfer;

pub use destination::ensure_directory;
pub use enumerator::{ContinuationToken, EnumerationEntry, HierarchyEnumerator, TransferEntry};
pub use journal::{FileJournal, HierarchySnapshot, Journal, MemoryJournal};
pub use options::HierarchyOptions;
pub use subdir::SubDirectoryTransfer;
pub use transfer::{HierarchyReport, HierarchyTransfer, TransferFailure};
