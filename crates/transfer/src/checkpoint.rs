//! Per-object resumable transfer state.
//!
//! `entry_offset` is the next byte offset nobody has claimed yet. The
//! transfer window holds offsets that were claimed but whose blocks are
//! not yet durable at the destination. Together they are enough to
//! resume: replay every window offset, then keep minting from
//! `entry_offset`.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Serializable view of a [`Checkpoint`], as persisted in the journal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSnapshot {
    pub entry_offset: u64,
    #[serde(default)]
    pub transfer_window: Vec<u64>,
    /// Unknown until the first metadata fetch.
    #[serde(default)]
    pub total_length: Option<u64>,
    #[serde(default)]
    pub content_identity_tag: String,
    /// Block size the window offsets were minted with (0 = not yet fixed).
    #[serde(default)]
    pub block_size: u64,
}

/// A block a worker is allowed to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub offset: u64,
    pub length: usize,
}

/// Claim/retire bookkeeping for one object, shared by all of its workers.
#[derive(Debug)]
pub struct Checkpoint {
    max_window: usize,
    state: Mutex<CheckpointState>,
}

#[derive(Debug)]
struct CheckpointState {
    entry_offset: u64,
    window: VecDeque<u64>,
    /// Window offsets not currently held by any worker.
    replay: VecDeque<u64>,
    total_length: Option<u64>,
    identity_tag: String,
    block_size: u64,
}

impl Checkpoint {
    /// Creates an empty checkpoint for a brand-new transfer.
    pub fn new(max_window: usize, block_size: usize) -> Self {
        Self::restore(CheckpointSnapshot::default(), max_window, block_size)
    }

    /// Rebuilds a checkpoint from a persisted snapshot.
    ///
    /// Every window offset is queued for replay. Call
    /// [`validate_restored`](Self::validate_restored) before use.
    pub fn restore(snapshot: CheckpointSnapshot, max_window: usize, block_size: usize) -> Self {
        let window: VecDeque<u64> = snapshot.transfer_window.into_iter().collect();
        let block_size = if snapshot.block_size == 0 {
            block_size as u64
        } else {
            snapshot.block_size
        };
        Self {
            max_window,
            state: Mutex::new(CheckpointState {
                entry_offset: snapshot.entry_offset,
                replay: window.clone(),
                window,
                total_length: snapshot.total_length,
                identity_tag: snapshot.content_identity_tag,
                block_size,
            }),
        }
    }

    pub fn snapshot(&self) -> CheckpointSnapshot {
        let s = self.state.lock().unwrap();
        CheckpointSnapshot {
            entry_offset: s.entry_offset,
            transfer_window: s.window.iter().copied().collect(),
            total_length: s.total_length,
            content_identity_tag: s.identity_tag.clone(),
            block_size: s.block_size,
        }
    }

    /// Checks the invariants a restored checkpoint must satisfy.
    pub fn validate_restored(&self) -> Result<(), TransferError> {
        let s = self.state.lock().unwrap();

        if s.entry_offset == 0 && !s.window.is_empty() {
            return Err(TransferError::CorruptedCheckpoint(
                "transfer window present with zero entry offset".into(),
            ));
        }
        if s.block_size == 0 {
            return Err(TransferError::CorruptedCheckpoint("zero block size".into()));
        }
        if let Some(total) = s.total_length
            && s.entry_offset > total
        {
            return Err(TransferError::CorruptedCheckpoint(format!(
                "entry offset {} beyond length {total}",
                s.entry_offset
            )));
        }
        for (i, &offset) in s.window.iter().enumerate() {
            if offset >= s.entry_offset {
                return Err(TransferError::CorruptedCheckpoint(format!(
                    "window offset {offset} not below entry offset {}",
                    s.entry_offset
                )));
            }
            if s.window.iter().skip(i + 1).any(|&o| o == offset) {
                return Err(TransferError::CorruptedCheckpoint(format!(
                    "duplicate window offset {offset}"
                )));
            }
        }
        Ok(())
    }

    /// `true` when nothing was ever claimed.
    pub fn is_fresh(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.entry_offset == 0 && s.window.is_empty()
    }

    /// Records the object's length and identity tag from a metadata fetch.
    ///
    /// Returns the number of blocks still to move: every window offset
    /// plus the blocks between `entry_offset` and the end.
    pub fn apply_metadata(&self, length: u64, identity_tag: &str) -> Result<u64, TransferError> {
        let mut s = self.state.lock().unwrap();

        if s.identity_tag.is_empty() {
            if s.entry_offset != 0 {
                return Err(TransferError::CorruptedCheckpoint(
                    "progress recorded without an identity tag".into(),
                ));
            }
            s.identity_tag = identity_tag.to_string();
        } else if s.identity_tag != identity_tag {
            return Err(TransferError::IdentityMismatch(format!(
                "expected {}, found {identity_tag}",
                s.identity_tag
            )));
        }

        if s.entry_offset > length {
            return Err(TransferError::CorruptedCheckpoint(format!(
                "entry offset {} beyond length {length}",
                s.entry_offset
            )));
        }
        if let Some(&bad) = s.window.iter().find(|&&o| o >= length) {
            return Err(TransferError::CorruptedCheckpoint(format!(
                "window offset {bad} beyond length {length}"
            )));
        }

        s.total_length = Some(length);
        let remaining = length - s.entry_offset;
        Ok(s.window.len() as u64 + remaining.div_ceil(s.block_size))
    }

    /// Claims the next block to read, if any.
    ///
    /// Replays leftover window offsets first. Minting a new offset
    /// appends it to the window and advances `entry_offset` in the same
    /// critical section, so concurrent callers never get the same block.
    pub fn claim(&self) -> Result<Option<Claim>, TransferError> {
        let mut s = self.state.lock().unwrap();
        let total = s.total_length.ok_or_else(|| {
            TransferError::CorruptedCheckpoint("claim before object length is known".into())
        })?;

        if let Some(offset) = s.replay.pop_front() {
            if offset >= total {
                return Err(TransferError::CorruptedCheckpoint(format!(
                    "replayed offset {offset} beyond length {total}"
                )));
            }
            let length = s.block_size.min(total - offset) as usize;
            return Ok(Some(Claim { offset, length }));
        }

        if s.window.len() < self.max_window && s.entry_offset < total {
            let offset = s.entry_offset;
            let length = s.block_size.min(total - offset);
            s.window.push_back(offset);
            s.entry_offset += length;
            return Ok(Some(Claim {
                offset,
                length: length as usize,
            }));
        }

        Ok(None)
    }

    /// Hands an unconfirmed claim back so another worker can replay it.
    pub fn requeue(&self, offset: u64) {
        let mut s = self.state.lock().unwrap();
        if s.window.contains(&offset) && !s.replay.contains(&offset) {
            s.replay.push_back(offset);
        }
    }

    /// Removes a durably written block from the window.
    ///
    /// Retirement order is free; it need not follow claim order.
    pub fn retire(&self, offset: u64) -> Result<(), TransferError> {
        let mut s = self.state.lock().unwrap();
        let Some(pos) = s.window.iter().position(|&o| o == offset) else {
            return Err(TransferError::CorruptedCheckpoint(format!(
                "retiring unclaimed offset {offset}"
            )));
        };
        s.window.remove(pos);
        s.replay.retain(|&o| o != offset);
        Ok(())
    }

    /// Cheap poll: could a claim plausibly succeed?
    pub fn has_claimable(&self) -> bool {
        let s = self.state.lock().unwrap();
        !s.replay.is_empty() || s.total_length.is_some_and(|t| s.entry_offset < t)
    }

    pub fn entry_offset(&self) -> u64 {
        self.state.lock().unwrap().entry_offset
    }

    pub fn total_length(&self) -> Option<u64> {
        self.state.lock().unwrap().total_length
    }

    pub fn window(&self) -> Vec<u64> {
        self.state.lock().unwrap().window.iter().copied().collect()
    }

    pub fn identity_tag(&self) -> String {
        self.state.lock().unwrap().identity_tag.clone()
    }

    pub fn block_size(&self) -> u64 {
        self.state.lock().unwrap().block_size
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }
}
