use std::sync::Arc;

use crate::checkpoint::{Checkpoint, CheckpointSnapshot};
use crate::location::Location;
use crate::options::TransferOptions;
use crate::pool::BufferGrant;

/// A block read into pooled buffers, waiting for the writer.
#[derive(Debug)]
pub struct Block {
    /// Byte offset within the object.
    pub offset: u64,
    /// Valid bytes across the grant's buffers.
    pub length: usize,
    grant: BufferGrant,
}

impl Block {
    pub fn new(offset: u64, length: usize, grant: BufferGrant) -> Self {
        Self {
            offset,
            length,
            grant,
        }
    }

    /// Valid bytes of each buffer, in order, with their object offsets.
    pub fn chunks(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        let size = self.grant.buffer_size();
        self.grant
            .buffers()
            .iter()
            .enumerate()
            .filter_map(move |(i, buf)| {
                let start = i * size;
                if start >= self.length {
                    return None;
                }
                let take = size.min(self.length - start);
                Some((self.offset + start as u64, &buf[..take]))
            })
    }
}

/// One source object mapped to one destination object.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Path relative to the hierarchy root (or the object name).
    pub relative_path: String,
    pub source: Location,
    pub destination: Location,
    pub checkpoint: Arc<Checkpoint>,
}

impl TransferJob {
    /// A job that starts from the beginning of the object.
    pub fn new(
        relative_path: impl Into<String>,
        source: Location,
        destination: Location,
        options: &TransferOptions,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            source,
            destination,
            checkpoint: Arc::new(Checkpoint::new(options.max_window_size, options.block_size)),
        }
    }

    /// A job that continues from a persisted checkpoint.
    pub fn resume(
        relative_path: impl Into<String>,
        source: Location,
        destination: Location,
        snapshot: CheckpointSnapshot,
        options: &TransferOptions,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            source,
            destination,
            checkpoint: Arc::new(Checkpoint::restore(
                snapshot,
                options.max_window_size,
                options.block_size,
            )),
        }
    }
}

/// Final report for one job, emitted when the scheduler retires it.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub relative_path: String,
    /// Checkpoint at retirement; persist it to resume a failed job.
    pub checkpoint: CheckpointSnapshot,
    pub result: JobResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Every block is durable. `bytes` counts this run only.
    Completed { bytes: u64 },
    Failed { error: String },
    Cancelled,
}

impl JobResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobResult::Completed { .. })
    }
}
