//! Per-object transfer state machine.
//!
//! A [`ChunkTransferUnit`] pairs a [`ChunkReader`], which claims block
//! offsets from the job's checkpoint and reads them into pooled buffers,
//! with a [`ChunkWriter`], which writes published blocks to the
//! destination and retires them. Each call to
//! [`do_work`](ChunkTransferUnit::do_work) performs one step: the
//! metadata step, one block read or one block write.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{AccessConditions, ObjectMetadata, RemoteError, RemoteObjectClient};
use crate::completion::CompletionCounter;
use crate::location::Location;
use crate::options::TransferOptions;
use crate::pool::{BufferGrant, BufferPool};
use crate::progress::TransferStatus;
use crate::sink::DestinationSink;
use crate::types::{Block, TransferJob};
use crate::{Claim, TransferError};

/// Lifecycle of a unit. `Finished` is terminal, on success or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    NotStarted,
    PreProcessing,
    Transferring,
    Finished,
}

/// Result of one [`ChunkTransferUnit::do_work`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// A step ran to completion.
    Progressed,
    /// Nothing could be done right now (no buffers, nothing claimable).
    Idle,
}

/// Resources every unit of one scheduler shares.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub options: TransferOptions,
    pub pool: BufferPool,
    pub status: Arc<TransferStatus>,
    pub cancel: CancellationToken,
    /// Signalled when a unit becomes ready mid-step.
    pub wake: Arc<Notify>,
}

impl TransferContext {
    pub fn new(options: TransferOptions, status: Arc<TransferStatus>, cancel: CancellationToken) -> Self {
        let pool = BufferPool::new(options.buffer_size, options.pool_capacity);
        Self::with_pool(options, pool, status, cancel)
    }

    pub fn with_pool(
        options: TransferOptions,
        pool: BufferPool,
        status: Arc<TransferStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            pool,
            status,
            cancel,
            wake: Arc::new(Notify::new()),
        }
    }
}

struct SharedTransferData {
    job: TransferJob,
    source: Arc<dyn RemoteObjectClient>,
    source_path: String,
    sink: DestinationSink,
    context: TransferContext,
    /// Blocks read but not yet written, keyed by offset.
    available: Mutex<BTreeMap<u64, Block>>,
    completion: CompletionCounter,
    state: Mutex<UnitState>,
    error: Mutex<Option<String>>,
    ready: AtomicBool,
    bytes_moved: AtomicU64,
}

impl SharedTransferData {
    fn state(&self) -> UnitState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: UnitState) {
        *self.state.lock().unwrap() = state;
    }

    fn is_finished(&self) -> bool {
        self.state() == UnitState::Finished
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Result<T, TransferError> {
        tokio::select! {
            biased;
            _ = self.context.cancel.cancelled() => Err(TransferError::Cancelled),
            out = fut => Ok(out),
        }
    }

    fn publish(&self, block: Block) {
        let mut available = self.available.lock().unwrap();
        debug_assert!(!available.contains_key(&block.offset));
        available.insert(block.offset, block);
    }

    fn take_available(&self) -> Option<Block> {
        self.available.lock().unwrap().pop_first().map(|(_, b)| b)
    }

    fn refresh(&self) -> bool {
        let ready = match self.state() {
            UnitState::NotStarted => true,
            UnitState::Transferring => {
                !self.available.lock().unwrap().is_empty() || self.job.checkpoint.has_claimable()
            }
            UnitState::PreProcessing | UnitState::Finished => false,
        };
        self.ready.store(ready, Ordering::Release);
        if ready {
            self.context.wake.notify_one();
        }
        ready
    }

    /// Retires one completion unit; the last one commits the destination.
    async fn complete_one(&self) -> Result<(), TransferError> {
        if !self.completion.signal() {
            return Ok(());
        }
        self.cancellable(self.sink.commit()).await??;
        self.set_state(UnitState::Finished);
        info!(
            path = %self.job.relative_path,
            bytes = self.bytes_moved.load(Ordering::Relaxed),
            "object transfer finished"
        );
        Ok(())
    }
}

/// Claims and reads blocks for one unit.
struct ChunkReader<'a> {
    shared: &'a SharedTransferData,
}

impl ChunkReader<'_> {
    async fn fetch_metadata(&self, conditions: &AccessConditions) -> Result<ObjectMetadata, TransferError> {
        let s = self.shared;
        Ok(s.cancellable(s.source.fetch_metadata(&s.source_path, conditions))
            .await??)
    }

    /// Validates the checkpoint, learns the object's length and arms the
    /// completion counter. A fresh transfer folds the first block read
    /// into the metadata request.
    async fn preprocess(&self) -> Result<WorkOutcome, TransferError> {
        let s = self.shared;
        let checkpoint = &s.job.checkpoint;

        checkpoint.validate_restored()?;

        let mut first_block: Option<(BufferGrant, usize)> = None;
        let metadata = if checkpoint.is_fresh()
            && (checkpoint.block_size() as usize) <= s.context.pool.buffer_size()
        {
            match s.context.pool.require_buffer() {
                Some(mut grant) => {
                    let want = (checkpoint.block_size() as usize).min(grant.buffer_size());
                    let read = {
                        let buf = &mut grant.buffers_mut()[0][..want];
                        s.cancellable(s.source.read_range(
                            &s.source_path,
                            0,
                            buf,
                            &AccessConditions::default(),
                        ))
                        .await?
                    };
                    match read {
                        Ok(read) => {
                            let metadata = read.metadata;
                            first_block = Some((grant, read.bytes_read));
                            metadata
                        }
                        Err(RemoteError::RangeNotSatisfiable) => {
                            drop(grant);
                            debug!(path = %s.source_path, "empty source, fetching metadata only");
                            self.fetch_metadata(&AccessConditions::default()).await?
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                None => self.fetch_metadata(&AccessConditions::default()).await?,
            }
        } else {
            self.fetch_metadata(&AccessConditions::if_match(checkpoint.identity_tag()))
                .await?
        };

        if metadata.type_tag.is_empty() {
            return Err(TransferError::UnknownObjectType(s.source_path.clone()));
        }

        let blocks = checkpoint.apply_metadata(metadata.length, &metadata.identity_tag)?;
        s.completion.arm(blocks + 1);
        s.cancellable(s.sink.prepare(metadata.length)).await??;
        s.set_state(UnitState::Transferring);
        debug!(
            path = %s.source_path,
            length = metadata.length,
            blocks,
            entry_offset = checkpoint.entry_offset(),
            "metadata applied"
        );

        if let Some((grant, bytes_read)) = first_block
            && metadata.length > 0
        {
            let claim = checkpoint.claim()?.ok_or_else(|| {
                TransferError::CorruptedCheckpoint("first block is not claimable".into())
            })?;
            if claim.offset != 0 || bytes_read != claim.length {
                checkpoint.requeue(claim.offset);
                return Err(TransferError::ShortRead {
                    offset: claim.offset,
                    expected: claim.length,
                    actual: bytes_read,
                });
            }
            s.publish(Block::new(0, claim.length, grant));
        }

        // The metadata step is itself one completion unit.
        s.complete_one().await?;
        Ok(WorkOutcome::Progressed)
    }

    /// Reads one claimed block into pooled buffers and publishes it.
    async fn read_next(&self) -> Result<WorkOutcome, TransferError> {
        let s = self.shared;
        let checkpoint = &s.job.checkpoint;

        // A resumed checkpoint keeps the block size it was minted with.
        let pool = &s.context.pool;
        if pool.buffer_size() == 0 {
            return Err(TransferError::InvalidConfig("pool buffer size is zero".into()));
        }
        let needed = (checkpoint.block_size() as usize).div_ceil(pool.buffer_size());
        if needed > pool.capacity() {
            return Err(TransferError::InvalidConfig(format!(
                "block of {} bytes needs {needed} buffers, pool holds {}",
                checkpoint.block_size(),
                pool.capacity()
            )));
        }
        let Some(mut grant) = pool.require_buffers(needed) else {
            return Ok(WorkOutcome::Idle);
        };
        let Some(claim) = checkpoint.claim()? else {
            return Ok(WorkOutcome::Idle);
        };
        // Other steps may claim while this read is in flight.
        s.refresh();

        let conditions = AccessConditions::if_match(checkpoint.identity_tag());
        if let Err(e) = self.read_block(claim, &mut grant, &conditions).await {
            checkpoint.requeue(claim.offset);
            return Err(e);
        }
        debug!(path = %s.source_path, offset = claim.offset, length = claim.length, "block read");

        if s.is_finished() {
            // Abandoned after a sibling step failed; the offset stays unretired.
            return Ok(WorkOutcome::Progressed);
        }
        s.publish(Block::new(claim.offset, claim.length, grant));
        Ok(WorkOutcome::Progressed)
    }

    /// Fills the grant's buffers with sequential sub-reads.
    async fn read_block(
        &self,
        claim: Claim,
        grant: &mut BufferGrant,
        conditions: &AccessConditions,
    ) -> Result<(), TransferError> {
        let s = self.shared;
        let size = grant.buffer_size();
        let mut done = 0usize;
        for buf in grant.buffers_mut() {
            if done >= claim.length {
                break;
            }
            let take = size.min(claim.length - done);
            let offset = claim.offset + done as u64;
            let read = s
                .cancellable(s.source.read_range(&s.source_path, offset, &mut buf[..take], conditions))
                .await??;
            if read.bytes_read != take {
                return Err(TransferError::ShortRead {
                    offset,
                    expected: take,
                    actual: read.bytes_read,
                });
            }
            done += take;
        }
        Ok(())
    }
}

/// Writes published blocks and retires them.
struct ChunkWriter<'a> {
    shared: &'a SharedTransferData,
}

impl ChunkWriter<'_> {
    async fn write(&self, block: Block) -> Result<WorkOutcome, TransferError> {
        let s = self.shared;
        for (offset, chunk) in block.chunks() {
            s.cancellable(s.sink.write_at(offset, chunk)).await??;
        }

        s.job.checkpoint.retire(block.offset)?;
        let length = block.length as u64;
        s.bytes_moved.fetch_add(length, Ordering::Relaxed);
        s.context.status.add_bytes(length);
        debug!(path = %s.job.relative_path, offset = block.offset, length, "block written");

        // Buffers go back to the pool before the commit round trip.
        drop(block);
        s.complete_one().await?;
        Ok(WorkOutcome::Progressed)
    }
}

/// Drives one [`TransferJob`] from metadata to the last durable block.
pub struct ChunkTransferUnit {
    shared: SharedTransferData,
}

impl ChunkTransferUnit {
    /// Creates a unit for `job`. The source must be a remote object.
    pub fn new(job: TransferJob, context: TransferContext) -> Result<Self, TransferError> {
        let Location::RemoteObject { endpoint, path } = &job.source else {
            return Err(TransferError::UnsupportedLocation(format!(
                "source {} is not a remote object",
                job.source.display()
            )));
        };
        let source = Arc::clone(&endpoint.objects);
        let source_path = path.clone();
        let sink = DestinationSink::for_location(&job.destination)?;

        Ok(Self {
            shared: SharedTransferData {
                job,
                source,
                source_path,
                sink,
                context,
                available: Mutex::new(BTreeMap::new()),
                completion: CompletionCounter::new(),
                state: Mutex::new(UnitState::NotStarted),
                error: Mutex::new(None),
                ready: AtomicBool::new(true),
                bytes_moved: AtomicU64::new(0),
            },
        })
    }

    /// Cheap poll: could a step make progress right now?
    pub fn has_work(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Clears the ready flag, returning whether it was set.
    ///
    /// The scheduler calls this right before dispatching a step.
    pub fn take_work(&self) -> bool {
        self.shared.ready.swap(false, Ordering::AcqRel)
    }

    /// Re-evaluates the ready flag and wakes the scheduler when set.
    pub fn refresh(&self) -> bool {
        self.shared.refresh()
    }

    /// Performs one step of work.
    ///
    /// An error marks the unit finished. Unretired offsets stay in the
    /// checkpoint so a later run replays them.
    pub async fn do_work(&self) -> Result<WorkOutcome, TransferError> {
        let result = self.step().await;
        match &result {
            Ok(_) => {
                self.refresh();
            }
            Err(e) => self.fail(e),
        }
        result
    }

    async fn step(&self) -> Result<WorkOutcome, TransferError> {
        let s = &self.shared;
        if s.context.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let state = {
            let mut state = s.state.lock().unwrap();
            let current = *state;
            if current == UnitState::NotStarted {
                *state = UnitState::PreProcessing;
            }
            current
        };

        match state {
            UnitState::NotStarted => ChunkReader { shared: s }.preprocess().await,
            UnitState::PreProcessing | UnitState::Finished => Ok(WorkOutcome::Idle),
            UnitState::Transferring => match s.take_available() {
                Some(block) => ChunkWriter { shared: s }.write(block).await,
                None => ChunkReader { shared: s }.read_next().await,
            },
        }
    }

    pub(crate) fn fail(&self, error: &TransferError) {
        let s = &self.shared;
        s.set_state(UnitState::Finished);
        s.ready.store(false, Ordering::Release);
        s.available.lock().unwrap().clear();
        let mut slot = s.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
        debug!(path = %s.job.relative_path, error = %error, "unit finished with error");
    }

    pub fn state(&self) -> UnitState {
        self.shared.state()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// First error that finished the unit, if any.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().unwrap().clone()
    }

    pub fn completion(&self) -> &CompletionCounter {
        &self.shared.completion
    }

    pub fn job(&self) -> &TransferJob {
        &self.shared.job
    }

    /// Bytes this unit made durable in the current run.
    pub fn bytes_moved(&self) -> u64 {
        self.shared.bytes_moved.load(Ordering::Relaxed)
    }
}
