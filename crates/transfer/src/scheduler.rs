//! Cooperative work-polling loop over active transfer units.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::{ChunkTransferUnit, TransferContext, WorkOutcome};
use crate::progress::TransferStatus;
use crate::types::{JobOutcome, JobResult, TransferJob};
use crate::{TransferError, TransferOptions};

struct ActiveUnit {
    unit: Arc<ChunkTransferUnit>,
    /// Steps of this unit currently running.
    in_flight: usize,
    /// Returned `Idle` last time; skipped until something progresses.
    parked: bool,
    error: Option<TransferError>,
}

/// How a spawned step ended.
enum StepEnd {
    Returned(Result<WorkOutcome, TransferError>),
    Panicked(TransferError),
}

/// Steps in flight, each mapped back to the unit that spawned it.
#[derive(Default)]
struct Steps {
    set: JoinSet<(u64, Result<WorkOutcome, TransferError>)>,
    owners: HashMap<task::Id, u64>,
}

impl Steps {
    fn spawn(&mut self, id: u64, unit: Arc<ChunkTransferUnit>) {
        let handle = self.set.spawn(async move { (id, unit.do_work().await) });
        self.owners.insert(handle.id(), id);
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Next finished step. Cancel-safe.
    async fn join_next(&mut self) -> Option<(u64, StepEnd)> {
        loop {
            match self.set.join_next_with_id().await? {
                Ok((task_id, (id, result))) => {
                    self.owners.remove(&task_id);
                    return Some((id, StepEnd::Returned(result)));
                }
                Err(e) => match self.owners.remove(&e.id()) {
                    Some(id) => {
                        let error = TransferError::Remote(format!("transfer step panicked: {e}"));
                        return Some((id, StepEnd::Panicked(error)));
                    }
                    None => warn!(error = %e, "step of unknown unit ended abnormally"),
                },
            }
        }
    }
}

/// Round-robins one step per ready unit per pass, bounded by
/// `max_concurrency` steps in flight across all units.
///
/// Holds no correctness state beyond membership; what is claimed and
/// what is durable lives in each job's checkpoint.
#[derive(Debug, Clone)]
pub struct TransferScheduler {
    context: TransferContext,
}

impl TransferScheduler {
    pub fn new(context: TransferContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &TransferContext {
        &self.context
    }

    /// Drives jobs from `jobs` until the channel closes and every unit
    /// is retired. Each retired job is reported on `outcomes`.
    ///
    /// Returns `Err(Cancelled)` after draining if the token fires;
    /// unfinished jobs are then reported as [`JobResult::Cancelled`].
    pub async fn run(
        &self,
        mut jobs: mpsc::Receiver<TransferJob>,
        outcomes: Option<mpsc::Sender<JobOutcome>>,
    ) -> Result<(), TransferError> {
        self.context.options.validate()?;
        let cancel = self.context.cancel.clone();
        let max_in_flight = self.context.options.max_concurrency.max(1);
        let idle_poll = self.context.options.idle_poll();

        let mut active: HashMap<u64, ActiveUnit> = HashMap::new();
        let mut order: Vec<u64> = Vec::new();
        let mut steps = Steps::default();
        let mut next_id = 0u64;
        let mut jobs_closed = false;

        loop {
            self.retire_finished(&mut active, &mut order, outcomes.as_ref())
                .await;

            if jobs_closed && active.is_empty() && steps.is_empty() {
                return Ok(());
            }

            // One pass: at most one new step per unit.
            for id in &order {
                if steps.len() >= max_in_flight {
                    break;
                }
                let Some(entry) = active.get_mut(id) else {
                    continue;
                };
                if entry.parked || entry.unit.is_finished() || !entry.unit.take_work() {
                    continue;
                }
                entry.in_flight += 1;
                steps.spawn(*id, Arc::clone(&entry.unit));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.drain(&mut steps, &mut active, &mut jobs, outcomes.as_ref()).await;
                    return Err(TransferError::Cancelled);
                }
                Some((id, end)) = steps.join_next(), if !steps.is_empty() => {
                    let progressed = self.record_step(&mut active, id, end);
                    if progressed {
                        unpark_all(&mut active);
                    }
                }
                job = jobs.recv(), if !jobs_closed => match job {
                    Some(job) => {
                        match ChunkTransferUnit::new(job.clone(), self.context.clone()) {
                            Ok(unit) => {
                                debug!(path = %job.relative_path, "job admitted");
                                active.insert(next_id, ActiveUnit {
                                    unit: Arc::new(unit),
                                    in_flight: 0,
                                    parked: false,
                                    error: None,
                                });
                                order.push(next_id);
                                next_id += 1;
                            }
                            Err(e) => {
                                self.report(&job, JobResult::Failed { error: e.to_string() }, outcomes.as_ref())
                                    .await;
                            }
                        }
                    }
                    None => jobs_closed = true,
                },
                _ = self.context.wake.notified() => {}
                _ = tokio::time::sleep(idle_poll) => {
                    unpark_all(&mut active);
                }
            }
        }
    }

    /// Books a finished step. Returns whether it made progress.
    fn record_step(
        &self,
        active: &mut HashMap<u64, ActiveUnit>,
        id: u64,
        end: StepEnd,
    ) -> bool {
        let Some(entry) = active.get_mut(&id) else {
            return false;
        };
        entry.in_flight -= 1;
        let result = match end {
            StepEnd::Returned(result) => result,
            StepEnd::Panicked(e) => {
                warn!(path = %entry.unit.job().relative_path, error = %e, "transfer step panicked");
                entry.unit.fail(&e);
                Err(e)
            }
        };
        match result {
            Ok(WorkOutcome::Progressed) => true,
            Ok(WorkOutcome::Idle) => {
                entry.parked = true;
                false
            }
            Err(e) => {
                if entry.error.is_none() {
                    entry.error = Some(e);
                }
                true
            }
        }
    }

    async fn retire_finished(
        &self,
        active: &mut HashMap<u64, ActiveUnit>,
        order: &mut Vec<u64>,
        outcomes: Option<&mpsc::Sender<JobOutcome>>,
    ) {
        let done: Vec<u64> = order
            .iter()
            .copied()
            .filter(|id| {
                active
                    .get(id)
                    .is_some_and(|e| e.in_flight == 0 && e.unit.is_finished())
            })
            .collect();

        for id in done {
            let Some(entry) = active.remove(&id) else {
                continue;
            };
            order.retain(|o| *o != id);
            let unit = entry.unit;
            let result = match entry.error {
                None => JobResult::Completed {
                    bytes: unit.bytes_moved(),
                },
                Some(TransferError::Cancelled) => JobResult::Cancelled,
                Some(e) => JobResult::Failed {
                    error: e.to_string(),
                },
            };
            self.report(unit.job(), result, outcomes).await;
        }
    }

    async fn report(
        &self,
        job: &TransferJob,
        result: JobResult,
        outcomes: Option<&mpsc::Sender<JobOutcome>>,
    ) {
        let status = &self.context.status;
        match &result {
            JobResult::Completed { bytes } => {
                status.file_transferred();
                info!(path = %job.relative_path, bytes, "job completed");
            }
            JobResult::Failed { error } => {
                status.file_failed();
                warn!(path = %job.relative_path, error = %error, "job failed");
            }
            JobResult::Cancelled => {
                debug!(path = %job.relative_path, "job cancelled");
            }
        }
        if let Some(tx) = outcomes {
            let _ = tx
                .send(JobOutcome {
                    relative_path: job.relative_path.clone(),
                    checkpoint: job.checkpoint.snapshot(),
                    result,
                })
                .await;
        }
    }

    /// Waits for in-flight steps to unwind, then reports everything left
    /// as cancelled. Pending jobs that never started are reported too.
    async fn drain(
        &self,
        steps: &mut Steps,
        active: &mut HashMap<u64, ActiveUnit>,
        jobs: &mut mpsc::Receiver<TransferJob>,
        outcomes: Option<&mpsc::Sender<JobOutcome>>,
    ) {
        while let Some((id, end)) = steps.join_next().await {
            self.record_step(active, id, end);
        }

        let mut ids: Vec<u64> = active.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(entry) = active.remove(&id) else {
                continue;
            };
            let result = match entry.error {
                Some(e) if !matches!(e, TransferError::Cancelled) => JobResult::Failed {
                    error: e.to_string(),
                },
                _ if entry.unit.is_finished() && entry.unit.error().is_none() => {
                    JobResult::Completed {
                        bytes: entry.unit.bytes_moved(),
                    }
                }
                _ => JobResult::Cancelled,
            };
            self.report(entry.unit.job(), result, outcomes).await;
        }

        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            self.report(&job, JobResult::Cancelled, outcomes).await;
        }
        info!("transfer scheduler cancelled");
    }
}

fn unpark_all(active: &mut HashMap<u64, ActiveUnit>) {
    for entry in active.values_mut() {
        if entry.parked {
            entry.parked = false;
            entry.unit.refresh();
        }
    }
}

/// Moves a single object and returns its outcome.
///
/// On cancellation the outcome is [`JobResult::Cancelled`] and its
/// checkpoint can be used to resume.
pub async fn transfer_object(
    job: TransferJob,
    options: TransferOptions,
    cancel: CancellationToken,
) -> Result<JobOutcome, TransferError> {
    options.validate()?;
    let context = TransferContext::new(options, Arc::new(TransferStatus::new()), cancel);
    let scheduler = TransferScheduler::new(context);

    let (jobs_tx, jobs_rx) = mpsc::channel(1);
    let (out_tx, mut out_rx) = mpsc::channel(1);
    let path = job.relative_path.clone();
    jobs_tx
        .send(job)
        .await
        .map_err(|_| TransferError::Remote("scheduler closed".into()))?;
    drop(jobs_tx);

    let run = scheduler.run(jobs_rx, Some(out_tx)).await;
    match out_rx.recv().await {
        Some(outcome) => Ok(outcome),
        None => {
            run?;
            Err(TransferError::Remote(format!("no outcome reported for {path}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSnapshot;
    use crate::testing::{MemoryStore, object, payload};
    use crate::Location;
    use std::time::Duration;

    const MIB4: u64 = 4 * 1024 * 1024;

    fn small_options() -> TransferOptions {
        TransferOptions {
            block_size: 16,
            buffer_size: 16,
            pool_capacity: 6,
            max_window_size: 4,
            max_concurrency: 4,
            idle_poll_ms: 5,
        }
    }

    #[tokio::test]
    async fn transfer_object_reports_completion() {
        let store = MemoryStore::new();
        let data = payload(10_000_000);
        store.put("big", data.clone());
        let options = TransferOptions::default();
        let job = TransferJob::new("big", object(&store, "big"), object(&store, "copy"), &options);

        let outcome = transfer_object(job, options, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.result, JobResult::Completed { bytes: 10_000_000 });
        assert_eq!(outcome.checkpoint.entry_offset, 10_000_000);
        assert!(outcome.checkpoint.transfer_window.is_empty());
        assert_eq!(store.get("copy").unwrap(), data);
        let mut offsets: Vec<u64> = store.reads_of("big").into_iter().map(|(o, _)| o).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, MIB4, 2 * MIB4]);
    }

    #[tokio::test]
    async fn failed_run_resumes_to_exact_total() {
        let store = MemoryStore::new();
        let data = payload(200);
        store.put("src", data.clone());
        store.fail_read_at("src", 96);
        let options = small_options();

        let job = TransferJob::new("src", object(&store, "src"), object(&store, "dst"), &options);
        let first = transfer_object(job, options.clone(), CancellationToken::new())
            .await
            .unwrap();
        let JobResult::Failed { .. } = first.result else {
            panic!("expected failure, got {:?}", first.result);
        };
        assert!(first.checkpoint.transfer_window.contains(&96));

        store.heal();
        store.clear_reads();
        let first_bytes = 200 - resume_bytes(&first.checkpoint);
        let job = TransferJob::resume(
            "src",
            object(&store, "src"),
            object(&store, "dst"),
            first.checkpoint,
            &options,
        );
        let second = transfer_object(job, options, CancellationToken::new())
            .await
            .unwrap();

        let JobResult::Completed { bytes } = second.result else {
            panic!("expected completion, got {:?}", second.result);
        };
        assert_eq!(first_bytes + bytes, 200);
        assert_eq!(store.get("dst").unwrap(), data);
        // Nothing already durable is read again.
        let reread: u64 = store.reads_of("src").iter().map(|&(_, l)| l as u64).sum();
        assert_eq!(reread, bytes);
    }

    /// Bytes still owed by a checkpoint: window blocks plus the tail.
    fn resume_bytes(snapshot: &CheckpointSnapshot) -> u64 {
        let total = snapshot.total_length.unwrap();
        let window: u64 = snapshot
            .transfer_window
            .iter()
            .map(|&o| snapshot.block_size.min(total - o))
            .sum();
        window + (total - snapshot.entry_offset)
    }

    #[tokio::test]
    async fn runs_many_jobs_and_counts_outcomes() {
        let store = MemoryStore::new();
        let options = small_options();
        let status = Arc::new(TransferStatus::new());
        let context = TransferContext::new(options.clone(), Arc::clone(&status), CancellationToken::new());
        let scheduler = TransferScheduler::new(context);

        let (jobs_tx, jobs_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for i in 0..8 {
            let name = format!("f{i}");
            store.put(&name, payload(i * 37));
            jobs_tx
                .send(TransferJob::new(
                    name.clone(),
                    object(&store, &name),
                    object(&store, &format!("out/{name}")),
                    &options,
                ))
                .await
                .unwrap();
        }
        jobs_tx
            .send(TransferJob::new("missing", object(&store, "missing"), object(&store, "out/missing"), &options))
            .await
            .unwrap();
        drop(jobs_tx);

        scheduler.run(jobs_rx, Some(out_tx)).await.unwrap();

        let mut completed = 0;
        let mut failed = 0;
        while let Some(outcome) = out_rx.recv().await {
            match outcome.result {
                JobResult::Completed { .. } => completed += 1,
                JobResult::Failed { .. } => failed += 1,
                JobResult::Cancelled => panic!("unexpected cancel"),
            }
        }
        assert_eq!((completed, failed), (8, 1));
        for i in 0..8 {
            assert_eq!(store.get(&format!("out/f{i}")).unwrap(), payload(i * 37));
        }
        let progress = status.snapshot();
        assert_eq!(progress.files_transferred, 8);
        assert_eq!(progress.files_failed, 1);
        assert_eq!(progress.bytes_transferred, (0..8).map(|i| i as u64 * 37).sum::<u64>());
        assert_eq!(scheduler.context().pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn pool_smaller_than_demand_still_completes() {
        let store = MemoryStore::new();
        let options = TransferOptions {
            pool_capacity: 1,
            ..small_options()
        };
        let context = TransferContext::new(options.clone(), Arc::new(TransferStatus::new()), CancellationToken::new());
        let scheduler = TransferScheduler::new(context);
        let (jobs_tx, jobs_rx) = mpsc::channel(4);
        for name in ["a", "b", "c"] {
            store.put(name, payload(100));
            jobs_tx
                .send(TransferJob::new(name, object(&store, name), object(&store, &format!("{name}.out")), &options))
                .await
                .unwrap();
        }
        drop(jobs_tx);

        scheduler.run(jobs_rx, None).await.unwrap();

        for name in ["a", "b", "c"] {
            assert_eq!(store.get(&format!("{name}.out")).unwrap(), payload(100));
        }
    }

    #[tokio::test]
    async fn cancellation_reports_pending_jobs() {
        let store = MemoryStore::new();
        store.put("src", payload(64));
        let options = small_options();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let context = TransferContext::new(options.clone(), Arc::new(TransferStatus::new()), cancel);
        let scheduler = TransferScheduler::new(context);

        let (jobs_tx, jobs_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        jobs_tx
            .send(TransferJob::new("src", object(&store, "src"), object(&store, "dst"), &options))
            .await
            .unwrap();

        let err = scheduler.run(jobs_rx, Some(out_tx)).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));

        let outcome = out_rx.recv().await.unwrap();
        assert_eq!(outcome.result, JobResult::Cancelled);
        assert_eq!(outcome.checkpoint.entry_offset, 0);
        assert!(store.reads_of("src").is_empty());
        drop(jobs_tx);
    }

    #[tokio::test]
    async fn panicking_read_fails_the_job_instead_of_hanging() {
        let store = MemoryStore::new();
        store.put("src", payload(64));
        store.panic_read_at("src", 16);
        let options = small_options();
        let job = TransferJob::new("src", object(&store, "src"), object(&store, "dst"), &options);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            transfer_object(job, options, CancellationToken::new()),
        )
        .await
        .expect("scheduler hung after a panicked step")
        .unwrap();

        let JobResult::Failed { error } = outcome.result else {
            panic!("expected failure, got {:?}", outcome.result);
        };
        assert!(error.contains("panicked"), "{error}");
        assert!(outcome.checkpoint.transfer_window.contains(&16));
    }

    #[tokio::test]
    async fn panicked_step_releases_its_buffers() {
        let store = MemoryStore::new();
        store.put("bad", payload(64));
        store.put("good", payload(64));
        store.panic_read_at("bad", 32);
        let options = small_options();
        let context = TransferContext::new(options.clone(), Arc::new(TransferStatus::new()), CancellationToken::new());
        let scheduler = TransferScheduler::new(context);
        let (jobs_tx, jobs_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        for name in ["bad", "good"] {
            jobs_tx
                .send(TransferJob::new(name, object(&store, name), object(&store, &format!("{name}.out")), &options))
                .await
                .unwrap();
        }
        drop(jobs_tx);

        tokio::time::timeout(Duration::from_secs(5), scheduler.run(jobs_rx, Some(out_tx)))
            .await
            .expect("scheduler hung after a panicked step")
            .unwrap();

        let mut results = HashMap::new();
        while let Some(outcome) = out_rx.recv().await {
            results.insert(outcome.relative_path, outcome.result);
        }
        assert!(matches!(results["bad"], JobResult::Failed { .. }));
        assert_eq!(results["good"], JobResult::Completed { bytes: 64 });
        assert_eq!(store.get("good.out").unwrap(), payload(64));
        assert_eq!(scheduler.context().pool.outstanding(), 0);
        assert_eq!(scheduler.context().status.snapshot().files_failed, 1);
    }

    #[tokio::test]
    async fn cancel_mid_transfer_leaves_resumable_checkpoint() {
        let store = MemoryStore::new();
        let data = payload(4096);
        store.put("src", data.clone());
        store.set_read_delay(Duration::from_millis(2));
        let options = small_options();
        let cancel = CancellationToken::new();
        let status = Arc::new(TransferStatus::new());
        let context = TransferContext::new(options.clone(), Arc::clone(&status), cancel.clone());
        let scheduler = TransferScheduler::new(context);
        let pool = scheduler.context().pool.clone();

        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        jobs_tx
            .send(TransferJob::new("src", object(&store, "src"), object(&store, "dst"), &options))
            .await
            .unwrap();
        drop(jobs_tx);
        let run = tokio::spawn(async move { scheduler.run(jobs_rx, Some(out_tx)).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while status.bytes_transferred() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("no block was written");
        cancel.cancel();

        let outcome = out_rx.recv().await.unwrap();
        assert!(matches!(run.await.unwrap(), Err(TransferError::Cancelled)));
        assert_eq!(outcome.result, JobResult::Cancelled);
        assert_eq!(pool.outstanding(), 0);

        let checkpoint = outcome.checkpoint;
        assert!(checkpoint.entry_offset > 0);
        assert!(checkpoint.entry_offset < 4096);
        for &offset in &checkpoint.transfer_window {
            assert!(offset < checkpoint.entry_offset);
            assert_eq!(offset % checkpoint.block_size, 0);
        }

        let owed = resume_bytes(&checkpoint);
        let job = TransferJob::resume("src", object(&store, "src"), object(&store, "dst"), checkpoint, &options);
        let resumed = transfer_object(job, options, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.result, JobResult::Completed { bytes: owed });
        assert_eq!(store.get("dst").unwrap(), data);
    }

    #[tokio::test]
    async fn steps_in_flight_never_exceed_max_concurrency() {
        let store = MemoryStore::new();
        store.set_read_delay(Duration::from_millis(1));
        let options = TransferOptions {
            max_concurrency: 2,
            pool_capacity: 16,
            ..small_options()
        };
        let context = TransferContext::new(options.clone(), Arc::new(TransferStatus::new()), CancellationToken::new());
        let scheduler = TransferScheduler::new(context);
        let (jobs_tx, jobs_rx) = mpsc::channel(8);
        for i in 0..6 {
            let name = format!("f{i}");
            store.put(&name, payload(160));
            jobs_tx
                .send(TransferJob::new(name.clone(), object(&store, &name), object(&store, &format!("{name}.out")), &options))
                .await
                .unwrap();
        }
        drop(jobs_tx);

        scheduler.run(jobs_rx, None).await.unwrap();

        let peak = store.peak_concurrent_reads();
        assert!(peak >= 1);
        assert!(peak <= 2, "{peak} reads ran at once");
        for i in 0..6 {
            assert_eq!(store.get(&format!("f{i}.out")).unwrap(), payload(160));
        }
    }

    #[tokio::test]
    async fn run_rejects_invalid_options() {
        let store = MemoryStore::new();
        store.put("src", payload(64));
        let options = TransferOptions {
            buffer_size: 0,
            ..small_options()
        };
        let context = TransferContext::new(options.clone(), Arc::new(TransferStatus::new()), CancellationToken::new());
        let scheduler = TransferScheduler::new(context);
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        jobs_tx
            .send(TransferJob::new("src", object(&store, "src"), object(&store, "dst"), &options))
            .await
            .unwrap();

        let err = scheduler.run(jobs_rx, None).await.unwrap_err();

        assert!(matches!(err, TransferError::InvalidConfig(_)));
        assert!(store.reads_of("src").is_empty());
        drop(jobs_tx);
    }

    #[tokio::test]
    async fn unsupported_source_fails_the_job() {
        let options = small_options();
        let job = TransferJob::new(
            "local",
            Location::Local("/nonexistent/a".into()),
            Location::Local("/nonexistent/b".into()),
            &options,
        );
        let outcome = transfer_object(job, options, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome.result, JobResult::Failed { .. }));
    }
}
