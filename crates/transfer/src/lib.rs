//! Resumable chunked object transfer with bounded memory.
//!
//! An object is split into fixed-size blocks. Each job owns a
//! [`Checkpoint`] that hands out block offsets to readers and tracks the
//! claimed-but-unconfirmed ones in a bounded transfer window, so an
//! interrupted transfer resumes exactly where it stopped. Buffers come
//! from a shared [`BufferPool`]; when it runs dry, units simply report
//! no work and are polled again on a later scheduler pass.

mod checkpoint;
mod chunked;
mod client;
mod completion;
mod error;
mod location;
mod options;
mod pool;
mod progress;
mod scheduler;
mod sink;
#[cfg(test)]
mod testing;
mod types;
mod validation;

pub use checkpoint::{Checkpoint, CheckpointSnapshot, Claim};
pub use chunked::{ChunkTransferUnit, TransferContext, UnitState, WorkOutcome};
pub use client::{
    AccessConditions, BoxFuture, ListPage, ListToken, ListedEntry, ObjectMetadata, RangeRead,
    RemoteDirectoryClient, RemoteError, RemoteObjectClient,
};
pub use completion::CompletionCounter;
pub use error::TransferError;
pub use location::{Location, RemoteEndpoint};
pub use options::TransferOptions;
pub use pool::{BufferGrant, BufferPool};
pub use progress::{ProgressCallback, ProgressTracker, SpeedCalculator, TransferProgress, TransferStatus};
pub use scheduler::{TransferScheduler, transfer_object};
pub use types::{Block, JobOutcome, JobResult, TransferJob};
pub use validation::{join_relative, validate_entry_name, validate_relative_path};

/// Default block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default maximum number of claimed-but-unconfirmed blocks per object.
pub const DEFAULT_MAX_WINDOW_SIZE: usize = 128;
