use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_WINDOW_SIZE, TransferError};

/// Tunables shared by every job a scheduler drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Size of one block, the unit of a single read/write.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Size of one pooled buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Number of buffers the pool may hand out at once.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Maximum claimed-but-unconfirmed blocks per object.
    #[serde(default = "default_max_window_size")]
    pub max_window_size: usize,

    /// Global ceiling on simultaneously in-flight block operations.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Re-poll interval when every unit reported no work.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_buffer_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_pool_capacity() -> usize {
    64
}

fn default_max_window_size() -> usize {
    DEFAULT_MAX_WINDOW_SIZE
}

fn default_max_concurrency() -> usize {
    32
}

fn default_idle_poll_ms() -> u64 {
    20
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            buffer_size: default_buffer_size(),
            pool_capacity: default_pool_capacity(),
            max_window_size: default_max_window_size(),
            max_concurrency: default_max_concurrency(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl TransferOptions {
    /// Number of pooled buffers one block occupies.
    pub fn buffers_per_block(&self) -> usize {
        self.block_size.div_ceil(self.buffer_size.max(1))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Rejects option sets the engine cannot run with.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.block_size == 0 {
            return Err(TransferError::InvalidConfig("block_size must be > 0".into()));
        }
        if self.buffer_size == 0 {
            return Err(TransferError::InvalidConfig("buffer_size must be > 0".into()));
        }
        if self.max_window_size == 0 {
            return Err(TransferError::InvalidConfig(
                "max_window_size must be > 0".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(TransferError::InvalidConfig(
                "max_concurrency must be > 0".into(),
            ));
        }
        if self.idle_poll_ms == 0 {
            return Err(TransferError::InvalidConfig("idle_poll_ms must be > 0".into()));
        }
        if self.pool_capacity < self.buffers_per_block() {
            return Err(TransferError::InvalidConfig(format!(
                "pool_capacity {} cannot hold one block of {} buffers",
                self.pool_capacity,
                self.buffers_per_block()
            )));
        }
        Ok(())
    }
}
