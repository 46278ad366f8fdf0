//! Recursive, resumable transfer of a directory tree.
//!
//! Walkers list directories and register what they find; the scheduler
//! moves the bytes. Every registration and every job outcome is written
//! to the journal, so an interrupted run picks up from the last saved
//! cursors and object checkpoints.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use datamover_transfer::{
    Checkpoint, CheckpointSnapshot, JobOutcome, JobResult, Location, ProgressCallback,
    ProgressTracker, TransferContext, TransferError, TransferJob, TransferOptions,
    TransferProgress, TransferScheduler, TransferStatus,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::destination::ensure_directory;
use crate::enumerator::{ContinuationToken, EnumerationEntry, TransferEntry};
use crate::journal::{HierarchySnapshot, Journal};
use crate::options::HierarchyOptions;
use crate::subdir::SubDirectoryTransfer;

/// A file or directory that could not be transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub relative_path: String,
    pub error: String,
}

/// Result of a hierarchy transfer that ran to the end.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchyReport {
    pub progress: TransferProgress,
    pub failures: Vec<TransferFailure>,
}

impl HierarchyReport {
    /// Some files or subtrees failed while the rest went through.
    pub fn is_partial_failure(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Mirrors a remote directory tree to a local or remote destination.
pub struct HierarchyTransfer {
    source: Location,
    destination: Location,
    options: HierarchyOptions,
    transfer_options: TransferOptions,
    journal: Arc<dyn Journal>,
    callbacks: Vec<ProgressCallback>,
}

impl HierarchyTransfer {
    pub fn new(
        source: Location,
        destination: Location,
        options: HierarchyOptions,
        transfer_options: TransferOptions,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            source,
            destination,
            options,
            transfer_options,
            journal,
            callbacks: Vec::new(),
        }
    }

    /// Registers a callback fed with periodic progress snapshots.
    pub fn on_progress(&mut self, callback: ProgressCallback) {
        self.callbacks.push(callback);
    }

    /// Runs the transfer to completion or cancellation.
    ///
    /// Failed files and subtrees are collected in the report; only a
    /// destination root that cannot be created aborts the whole run.
    /// On cancellation the journal holds everything needed to resume.
    pub async fn run(self, cancel: CancellationToken) -> Result<HierarchyReport, TransferError> {
        self.options.validate()?;
        self.transfer_options.validate()?;

        let snapshot = match self.journal.load().await? {
            Some(snapshot) if !snapshot.is_empty() => {
                info!(
                    directories = snapshot.directories.len(),
                    jobs = snapshot.jobs.len(),
                    "resuming hierarchy transfer"
                );
                snapshot
            }
            _ => {
                let mut fresh = HierarchySnapshot::default();
                fresh.directories.insert(String::new(), None);
                fresh
            }
        };

        let status = Arc::new(TransferStatus::restore(&snapshot.progress));
        let tracker = ProgressTracker::new(Arc::clone(&status), None);
        for callback in self.callbacks {
            tracker.on_progress(callback);
        }
        tracker.start();

        match ensure_directory(&self.destination, &cancel).await {
            Ok(created) => {
                for _ in 0..created {
                    status.directory_created();
                }
            }
            Err(TransferError::Cancelled) => {
                tracker.stop();
                return Err(TransferError::Cancelled);
            }
            Err(e) => {
                error!(destination = %self.destination.display(), error = %e, "cannot create destination root");
                tracker.stop();
                return Err(TransferError::DestinationRoot {
                    path: self.destination.display(),
                    message: e.to_string(),
                });
            }
        }

        info!(
            source = %self.source.display(),
            destination = %self.destination.display(),
            "hierarchy transfer started"
        );

        let shared = Arc::new(Shared::new(
            self.source,
            self.destination,
            self.options,
            self.transfer_options,
            self.journal,
            Arc::clone(&status),
            cancel.clone(),
            snapshot.directories.clone(),
        ));

        let depth = shared.options.job_queue_depth;
        let (jobs_tx, jobs_rx) = mpsc::channel(depth);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(depth);
        let scheduler = TransferScheduler::new(TransferContext::new(
            shared.transfer_options.clone(),
            Arc::clone(&status),
            cancel.clone(),
        ));
        let mut scheduler_task =
            tokio::spawn(async move { scheduler.run(jobs_rx, Some(outcomes_tx)).await });
        let consumer_task = tokio::spawn(consume_outcomes(Arc::clone(&shared), outcomes_rx));

        let period = shared.options.journal_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for (path, checkpoint) in snapshot.jobs {
            if cancel.is_cancelled() {
                break;
            }
            match shared.resume_job(&path, checkpoint) {
                Ok(job) => {
                    debug!(path = %job.relative_path, "resubmitting job");
                    if send_job(&jobs_tx, job, &cancel).await.is_err() {
                        break;
                    }
                }
                Err(e) => shared.record_failure(&path, &e),
            }
        }

        let mut pending: VecDeque<(String, Option<ContinuationToken>)> =
            snapshot.directories.into_iter().collect();
        let mut walkers: JoinSet<Vec<String>> = JoinSet::new();
        let listing_concurrency = shared.options.listing_concurrency;

        loop {
            while walkers.len() < listing_concurrency && !cancel.is_cancelled() {
                let Some((relative_path, resume)) = pending.pop_front() else {
                    break;
                };
                walkers.spawn(walk_directory(
                    Arc::clone(&shared),
                    jobs_tx.clone(),
                    relative_path,
                    resume,
                ));
            }
            if walkers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                joined = walkers.join_next() => match joined {
                    Some(Ok(children)) => {
                        pending.extend(children.into_iter().map(|child| (child, None)));
                    }
                    Some(Err(e)) => warn!(error = %e, "directory walker panicked"),
                    None => {}
                },
                _ = ticker.tick() => shared.save_logged().await,
            }
        }
        drop(jobs_tx);

        let scheduled = loop {
            tokio::select! {
                joined = &mut scheduler_task => break joined,
                _ = ticker.tick() => shared.save_logged().await,
            }
        };
        if let Err(e) = consumer_task.await {
            warn!(error = %e, "outcome consumer panicked");
        }

        shared.save().await?;
        tracker.notify_progress();
        tracker.stop();

        let scheduled = scheduled.map_err(|e| TransferError::Io(std::io::Error::other(e)))?;
        if cancel.is_cancelled() || matches!(scheduled, Err(TransferError::Cancelled)) {
            info!("hierarchy transfer cancelled");
            return Err(TransferError::Cancelled);
        }
        scheduled?;

        let report = HierarchyReport {
            progress: status.snapshot(),
            failures: shared.failures(),
        };
        info!(
            files = report.progress.files_transferred,
            skipped = report.progress.files_skipped,
            failed = report.progress.files_failed,
            bytes = report.progress.bytes_transferred,
            "hierarchy transfer finished"
        );
        Ok(report)
    }
}

struct HierarchyState {
    /// Directories not fully listed yet, with their resume cursor.
    directories: BTreeMap<String, Option<ContinuationToken>>,
    /// Jobs handed to the scheduler and not reported back yet.
    live: HashMap<String, Arc<Checkpoint>>,
    /// Checkpoints of failed or cancelled jobs, kept for the next run.
    retained: BTreeMap<String, CheckpointSnapshot>,
    failures: Vec<TransferFailure>,
}

/// What a walker should do with a listed file.
#[derive(Debug)]
enum FileRegistration {
    Submit(TransferJob),
    /// A job for this path is already running; nothing to do.
    Duplicate,
}

struct Shared {
    source: Location,
    destination: Location,
    options: HierarchyOptions,
    transfer_options: TransferOptions,
    journal: Arc<dyn Journal>,
    status: Arc<TransferStatus>,
    cancel: CancellationToken,
    state: Mutex<HierarchyState>,
    /// Orders journal writes so a newer snapshot is never overwritten
    /// by an older one.
    save_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    fn new(
        source: Location,
        destination: Location,
        options: HierarchyOptions,
        transfer_options: TransferOptions,
        journal: Arc<dyn Journal>,
        status: Arc<TransferStatus>,
        cancel: CancellationToken,
        directories: BTreeMap<String, Option<ContinuationToken>>,
    ) -> Self {
        Self {
            source,
            destination,
            options,
            transfer_options,
            journal,
            status,
            cancel,
            state: Mutex::new(HierarchyState {
                directories,
                live: HashMap::new(),
                retained: BTreeMap::new(),
                failures: Vec::new(),
            }),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn snapshot(&self) -> HierarchySnapshot {
        let state = self.state.lock().unwrap();
        let mut jobs = state.retained.clone();
        for (path, checkpoint) in &state.live {
            jobs.insert(path.clone(), checkpoint.snapshot());
        }
        HierarchySnapshot {
            directories: state.directories.clone(),
            jobs,
            progress: self.status.snapshot(),
        }
    }

    async fn save(&self) -> Result<(), TransferError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot();
        self.journal.save(&snapshot).await
    }

    async fn save_logged(&self) {
        if let Err(e) = self.save().await {
            warn!(error = %e, "failed to save journal");
        }
    }

    fn failures(&self) -> Vec<TransferFailure> {
        self.state.lock().unwrap().failures.clone()
    }

    fn record_failure(&self, relative_path: &str, error: &TransferError) {
        self.state.lock().unwrap().failures.push(TransferFailure {
            relative_path: relative_path.to_string(),
            error: error.to_string(),
        });
    }

    fn job_locations(&self, relative_path: &str) -> Result<(Location, Location), TransferError> {
        Ok((
            self.source.child_object(relative_path)?,
            self.destination.child_object(relative_path)?,
        ))
    }

    /// Rebuilds a job from a journaled checkpoint and marks it live.
    fn resume_job(
        &self,
        relative_path: &str,
        checkpoint: CheckpointSnapshot,
    ) -> Result<TransferJob, TransferError> {
        let (source, destination) = self.job_locations(relative_path)?;
        let job = TransferJob::resume(
            relative_path,
            source,
            destination,
            checkpoint,
            &self.transfer_options,
        );
        self.state
            .lock()
            .unwrap()
            .live
            .insert(job.relative_path.clone(), Arc::clone(&job.checkpoint));
        Ok(job)
    }

    /// Advances `parent`'s cursor past a subdirectory entry and queues
    /// the subdirectory. Returns false when it is already queued.
    fn register_directory(&self, parent: &str, entry: &TransferEntry) -> bool {
        let mut state = self.state.lock().unwrap();
        let added = !state.directories.contains_key(&entry.relative_path);
        if added {
            state.directories.insert(entry.relative_path.clone(), None);
        }
        state
            .directories
            .insert(parent.to_string(), Some(entry.token.clone()));
        added
    }

    /// Advances `parent`'s cursor past a file entry and, unless a job for
    /// it is already live, creates that job.
    fn register_file(
        &self,
        parent: &str,
        entry: &TransferEntry,
        source: Location,
        destination: Location,
    ) -> FileRegistration {
        let mut state = self.state.lock().unwrap();
        state
            .directories
            .insert(parent.to_string(), Some(entry.token.clone()));
        if state.live.contains_key(&entry.relative_path) {
            return FileRegistration::Duplicate;
        }
        let job = TransferJob::new(
            entry.relative_path.clone(),
            source,
            destination,
            &self.transfer_options,
        );
        state.retained.remove(&entry.relative_path);
        state
            .live
            .insert(entry.relative_path.clone(), Arc::clone(&job.checkpoint));
        FileRegistration::Submit(job)
    }

    /// Advances `parent`'s cursor past an entry that needs no job.
    fn advance_cursor(&self, parent: &str, token: &ContinuationToken) {
        self.state
            .lock()
            .unwrap()
            .directories
            .insert(parent.to_string(), Some(token.clone()));
    }

    fn directory_done(&self, relative_path: &str) {
        self.state.lock().unwrap().directories.remove(relative_path);
    }

    fn record_outcome(&self, outcome: JobOutcome) {
        let mut state = self.state.lock().unwrap();
        state.live.remove(&outcome.relative_path);
        match outcome.result {
            JobResult::Completed { .. } => {
                state.retained.remove(&outcome.relative_path);
            }
            JobResult::Failed { error } => {
                state
                    .retained
                    .insert(outcome.relative_path.clone(), outcome.checkpoint);
                state.failures.push(TransferFailure {
                    relative_path: outcome.relative_path,
                    error,
                });
            }
            JobResult::Cancelled => {
                state
                    .retained
                    .insert(outcome.relative_path, outcome.checkpoint);
            }
        }
    }
}

async fn send_job(
    jobs: &mpsc::Sender<TransferJob>,
    job: TransferJob,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        sent = jobs.send(job) => sent.map_err(|_| TransferError::Remote("scheduler closed".into())),
    }
}

async fn consume_outcomes(shared: Arc<Shared>, mut outcomes: mpsc::Receiver<JobOutcome>) {
    while let Some(outcome) = outcomes.recv().await {
        shared.record_outcome(outcome);
        shared.save_logged().await;
    }
}

/// Lists one directory, registering and journaling every entry.
///
/// Returns the subdirectories it queued. A listing failure aborts this
/// subtree only; its cursor stays in the journal for the next run.
async fn walk_directory(
    shared: Arc<Shared>,
    jobs: mpsc::Sender<TransferJob>,
    relative_path: String,
    resume: Option<ContinuationToken>,
) -> Vec<String> {
    let cancel = shared.cancel.clone();
    let mut children = Vec::new();

    match walk_entries(&shared, &jobs, &relative_path, resume, &mut children, &cancel).await {
        Ok(()) => {
            shared.directory_done(&relative_path);
            shared.save_logged().await;
            debug!(path = %relative_path, "directory listed");
        }
        Err(TransferError::Cancelled) => {}
        Err(e) => {
            warn!(path = %relative_path, error = %e, "subtree aborted");
            shared.record_failure(&relative_path, &e);
            shared.save_logged().await;
        }
    }
    children
}

async fn walk_entries(
    shared: &Shared,
    jobs: &mpsc::Sender<TransferJob>,
    relative_path: &str,
    resume: Option<ContinuationToken>,
    children: &mut Vec<String>,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let mut level =
        SubDirectoryTransfer::new(relative_path, &shared.source, &shared.destination, resume)?;

    let created = level.create_destination_directory(cancel).await?;
    for _ in 0..created {
        shared.status.directory_created();
    }

    while let Some(entry) = level.next_entry(cancel).await {
        let entry = match entry {
            EnumerationEntry::Item(entry) => entry,
            EnumerationEntry::Error(e) => return Err(e),
        };

        if entry.is_directory {
            if shared.register_directory(relative_path, &entry) {
                children.push(entry.relative_path.clone());
            }
            shared.save_logged().await;
            continue;
        }

        let (source, destination) = shared.job_locations(&entry.relative_path)?;
        if !shared.options.overwrite && destination.exists().await? {
            debug!(path = %entry.relative_path, "destination exists, skipping");
            shared.status.file_skipped();
            shared.advance_cursor(relative_path, &entry.token);
            shared.save_logged().await;
            continue;
        }

        match shared.register_file(relative_path, &entry, source, destination) {
            FileRegistration::Submit(job) => {
                shared.save_logged().await;
                send_job(jobs, job, cancel).await?;
            }
            FileRegistration::Duplicate => {
                debug!(path = %entry.relative_path, "job already running");
                shared.save_logged().await;
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use datamover_local_store::LocalStore;
    use datamover_transfer::{
        AccessConditions, BoxFuture, ListPage, ListToken, ObjectMetadata, RangeRead,
        RemoteDirectoryClient, RemoteEndpoint, RemoteError, RemoteObjectClient,
    };
    use std::path::Path;

    fn options() -> TransferOptions {
        TransferOptions {
            block_size: 8,
            buffer_size: 8,
            pool_capacity: 4,
            max_window_size: 2,
            max_concurrency: 4,
            idle_poll_ms: 5,
        }
    }

    fn hierarchy_options() -> HierarchyOptions {
        HierarchyOptions {
            listing_concurrency: 2,
            page_size: 2,
            journal_interval_ms: 20,
            ..Default::default()
        }
    }

    fn remote_root<S>(store: Arc<S>) -> Location
    where
        S: RemoteObjectClient + RemoteDirectoryClient + 'static,
    {
        Location::RemoteDirectory {
            endpoint: RemoteEndpoint::from_store("src", store),
            path: String::new(),
        }
    }

    fn store(root: &Path) -> Arc<LocalStore> {
        Arc::new(LocalStore::new(root).with_page_size(2))
    }

    fn write(root: &Path, relative: &str, data: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn bytes(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    fn tree(root: &Path) -> Vec<(&'static str, Vec<u8>)> {
        let files = vec![
            ("a.txt", bytes(20, 1)),
            ("b.bin", Vec::new()),
            ("docs/c.txt", bytes(9, 2)),
            ("docs/deep/d.txt", bytes(30, 3)),
            ("e.txt", bytes(8, 4)),
        ];
        for (path, data) in &files {
            write(root, path, data);
        }
        files
    }

    fn transfer(source: Location, dst: &Path, journal: Arc<dyn Journal>) -> HierarchyTransfer {
        HierarchyTransfer::new(
            source,
            Location::Local(dst.to_path_buf()),
            hierarchy_options(),
            options(),
            journal,
        )
    }

    #[tokio::test]
    async fn copies_whole_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let files = tree(src.path());
        let journal = Arc::new(MemoryJournal::new());

        let report = transfer(remote_root(store(src.path())), dst.path(), journal.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        for (path, data) in &files {
            assert_eq!(std::fs::read(dst.path().join(path)).unwrap(), *data, "{path}");
        }
        assert!(report.failures.is_empty());
        assert_eq!(report.progress.files_transferred, 5);
        assert_eq!(report.progress.directories_created, 2);
        assert_eq!(report.progress.bytes_transferred, 67);
        assert!(journal.latest().unwrap().is_empty());
        assert!(journal.save_count() > 5);
    }

    #[tokio::test]
    async fn completed_journal_starts_fresh() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tree(src.path());
        let journal = Arc::new(MemoryJournal::new());

        transfer(remote_root(store(src.path())), dst.path(), journal.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();
        let again = transfer(remote_root(store(src.path())), dst.path(), journal)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(again.progress.files_transferred, 5);
        assert_eq!(again.progress.directories_created, 0);
    }

    #[tokio::test]
    async fn existing_files_are_skipped_without_overwrite() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tree(src.path());
        write(dst.path(), "a.txt", b"old");

        let mut t = transfer(
            remote_root(store(src.path())),
            dst.path(),
            Arc::new(MemoryJournal::new()),
        );
        t.options.overwrite = false;
        let report = t.run(CancellationToken::new()).await.unwrap();

        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"old");
        assert_eq!(report.progress.files_skipped, 1);
        assert_eq!(report.progress.files_transferred, 4);
    }

    #[tokio::test]
    async fn resumes_listing_and_partial_object() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let big = bytes(40, 9);
        write(src.path(), "a.txt", b"aaaa");
        write(src.path(), "b.txt", b"bbbb");
        write(src.path(), "c.bin", &big);
        write(src.path(), "d.txt", b"dddd");
        // Block 0 landed before the interruption; block 8 was in flight.
        write(dst.path(), "c.bin", &big[..8]);

        let source = store(src.path());
        let tag = source
            .fetch_metadata("c.bin", &AccessConditions::default())
            .await
            .unwrap()
            .identity_tag;

        let mut snapshot = HierarchySnapshot::default();
        // Second page ("after b.txt") with c.bin already registered.
        snapshot.directories.insert(
            String::new(),
            Some(ContinuationToken {
                page: Some(ListToken("b.txt".into())),
                consumed: 1,
            }),
        );
        snapshot.jobs.insert(
            "c.bin".into(),
            CheckpointSnapshot {
                entry_offset: 16,
                transfer_window: vec![8],
                total_length: Some(40),
                content_identity_tag: tag,
                block_size: 8,
            },
        );
        snapshot.progress.bytes_transferred = 8;
        let journal = Arc::new(MemoryJournal::with_snapshot(snapshot));

        let report = transfer(remote_root(source), dst.path(), journal.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dst.path().join("c.bin")).unwrap(), big);
        assert_eq!(std::fs::read(dst.path().join("d.txt")).unwrap(), b"dddd");
        assert!(!dst.path().join("a.txt").exists());
        assert!(!dst.path().join("b.txt").exists());
        assert_eq!(report.progress.bytes_transferred, 40 + 4);
        assert_eq!(report.progress.files_transferred, 2);
        assert!(journal.latest().unwrap().is_empty());
    }

    fn shared_for(src: &Path, dst: &Path) -> Shared {
        let mut directories = BTreeMap::new();
        directories.insert(String::new(), None);
        Shared::new(
            remote_root(store(src)),
            Location::Local(dst.to_path_buf()),
            hierarchy_options(),
            options(),
            Arc::new(MemoryJournal::new()),
            Arc::new(TransferStatus::new()),
            CancellationToken::new(),
            directories,
        )
    }

    fn entry(path: &str, is_directory: bool, consumed: usize) -> TransferEntry {
        TransferEntry {
            is_directory,
            relative_path: path.to_string(),
            token: ContinuationToken {
                page: None,
                consumed,
            },
        }
    }

    #[tokio::test]
    async fn re_emitted_live_file_is_not_duplicated() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let shared = shared_for(src.path(), dst.path());
        let (source, destination) = shared.job_locations("x.bin").unwrap();

        let first = shared.register_file("", &entry("x.bin", false, 1), source.clone(), destination.clone());
        assert!(matches!(first, FileRegistration::Submit(_)));
        let again = shared.register_file("", &entry("x.bin", false, 1), source, destination);
        assert!(matches!(again, FileRegistration::Duplicate));

        let snapshot = shared.snapshot();
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.directories[""].as_ref().unwrap().consumed, 1);
    }

    #[tokio::test]
    async fn re_emitted_directory_keeps_its_cursor() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let shared = shared_for(src.path(), dst.path());

        assert!(shared.register_directory("", &entry("docs", true, 1)));
        shared.advance_cursor("docs", &ContinuationToken { page: None, consumed: 4 });
        assert!(!shared.register_directory("", &entry("docs", true, 1)));

        let snapshot = shared.snapshot();
        assert_eq!(snapshot.directories["docs"].as_ref().unwrap().consumed, 4);
    }

    #[tokio::test]
    async fn failed_outcome_keeps_checkpoint() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let shared = shared_for(src.path(), dst.path());
        let (source, destination) = shared.job_locations("x.bin").unwrap();
        let FileRegistration::Submit(job) =
            shared.register_file("", &entry("x.bin", false, 1), source, destination)
        else {
            panic!("expected a new job");
        };

        shared.record_outcome(JobOutcome {
            relative_path: job.relative_path.clone(),
            checkpoint: job.checkpoint.snapshot(),
            result: JobResult::Failed {
                error: "boom".into(),
            },
        });

        let snapshot = shared.snapshot();
        assert!(snapshot.jobs.contains_key("x.bin"));
        assert_eq!(shared.failures()[0].relative_path, "x.bin");
    }

    /// Delegates to a local store but fails chosen listings and reads.
    struct Faulty {
        inner: LocalStore,
        broken_directory: String,
        broken_object: String,
    }

    impl RemoteObjectClient for Faulty {
        fn fetch_metadata<'a>(
            &'a self,
            object: &'a str,
            conditions: &'a AccessConditions,
        ) -> BoxFuture<'a, Result<ObjectMetadata, RemoteError>> {
            self.inner.fetch_metadata(object, conditions)
        }

        fn read_range<'a>(
            &'a self,
            object: &'a str,
            offset: u64,
            buf: &'a mut [u8],
            conditions: &'a AccessConditions,
        ) -> BoxFuture<'a, Result<RangeRead, RemoteError>> {
            if object == self.broken_object {
                return Box::pin(async { Err(RemoteError::Generic("connection reset".into())) });
            }
            self.inner.read_range(object, offset, buf, conditions)
        }
    }

    impl RemoteDirectoryClient for Faulty {
        fn list<'a>(
            &'a self,
            directory: &'a str,
            token: Option<&'a ListToken>,
        ) -> BoxFuture<'a, Result<ListPage, RemoteError>> {
            if directory == self.broken_directory {
                return Box::pin(async { Err(RemoteError::Generic("listing throttled".into())) });
            }
            self.inner.list(directory, token)
        }

        fn create_directory<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
            self.inner.create_directory(path)
        }
    }

    #[tokio::test]
    async fn failures_stay_local_to_their_subtree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let files = tree(src.path());
        let faulty = Arc::new(Faulty {
            inner: LocalStore::new(src.path()).with_page_size(2),
            broken_directory: "docs/deep".into(),
            broken_object: "a.txt".into(),
        });
        let journal = Arc::new(MemoryJournal::new());

        let report = transfer(remote_root(faulty), dst.path(), journal.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_partial_failure());
        let mut failed: Vec<&str> = report
            .failures
            .iter()
            .map(|f| f.relative_path.as_str())
            .collect();
        failed.sort_unstable();
        assert_eq!(failed, ["a.txt", "docs/deep"]);
        assert_eq!(report.progress.files_failed, 1);

        for (path, data) in &files {
            if matches!(*path, "a.txt" | "docs/deep/d.txt") {
                continue;
            }
            assert_eq!(std::fs::read(dst.path().join(path)).unwrap(), *data, "{path}");
        }

        let left = journal.latest().unwrap();
        assert!(left.directories.contains_key("docs/deep"));
        assert!(left.jobs.contains_key("a.txt"));
    }

    #[tokio::test]
    async fn destination_root_failure_is_fatal() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tree(src.path());
        let blocker = dst.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let err = transfer(
            remote_root(store(src.path())),
            &blocker.join("inside"),
            Arc::new(MemoryJournal::new()),
        )
        .run(CancellationToken::new())
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::DestinationRoot { .. }));
    }

    #[tokio::test]
    async fn cancelled_run_copies_nothing() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tree(src.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transfer(
            remote_root(store(src.path())),
            &dst.path().join("out"),
            Arc::new(MemoryJournal::new()),
        )
        .run(cancel)
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert!(!dst.path().join("out").exists());
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let mut t = transfer(
            remote_root(store(src.path())),
            dst.path(),
            Arc::new(MemoryJournal::new()),
        );
        t.options.job_queue_depth = 0;
        assert!(matches!(
            t.run(CancellationToken::new()).await,
            Err(TransferError::InvalidConfig(_))
        ));
    }
}
