use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Default progress notification interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

const SPEED_WINDOW: Duration = Duration::from_secs(5);
const SPEED_SAMPLES: usize = 100;

/// Point-in-time view of the progress counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub directories_created: u64,
    /// Recent throughput; not persisted meaningfully across runs.
    #[serde(default)]
    pub bytes_per_second: f64,
}

/// Monotonic counters shared by every job of one transfer.
pub struct TransferStatus {
    bytes_transferred: AtomicU64,
    files_transferred: AtomicU64,
    files_skipped: AtomicU64,
    files_failed: AtomicU64,
    directories_created: AtomicU64,
    speed: SpeedCalculator,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStatus {
    pub fn new() -> Self {
        Self::restore(&TransferProgress::default())
    }

    /// Starts counting from previously persisted totals.
    pub fn restore(progress: &TransferProgress) -> Self {
        Self {
            bytes_transferred: AtomicU64::new(progress.bytes_transferred),
            files_transferred: AtomicU64::new(progress.files_transferred),
            files_skipped: AtomicU64::new(progress.files_skipped),
            files_failed: AtomicU64::new(progress.files_failed),
            directories_created: AtomicU64::new(progress.directories_created),
            speed: SpeedCalculator::new(SPEED_WINDOW, SPEED_SAMPLES),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.speed.record(bytes);
    }

    pub fn file_transferred(&self) {
        self.files_transferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn directory_created(&self) {
        self.directories_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TransferProgress {
        TransferProgress {
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            directories_created: self.directories_created.load(Ordering::Relaxed),
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }
}

impl std::fmt::Debug for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferStatus")
            .field("progress", &self.snapshot())
            .finish()
    }
}

/// Callback invoked with transfer progress.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Reports a [`TransferStatus`] to callbacks, on demand or periodically.
pub struct ProgressTracker {
    status: Arc<TransferStatus>,
    inner: Arc<RwLock<TrackerInner>>,
    stop: Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
}

struct TrackerInner {
    callbacks: Vec<ProgressCallback>,
    interval: Duration,
}

impl ProgressTracker {
    /// Creates a new tracker with the given notification interval.
    ///
    /// If `interval` is `None`, defaults to 500 ms.
    pub fn new(status: Arc<TransferStatus>, interval: Option<Duration>) -> Self {
        Self {
            status,
            inner: Arc::new(RwLock::new(TrackerInner {
                callbacks: Vec::new(),
                interval: interval.unwrap_or(DEFAULT_INTERVAL),
            })),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        let mut inner = self.inner.write().unwrap();
        inner.callbacks.push(callback);
    }

    pub fn status(&self) -> &Arc<TransferStatus> {
        &self.status
    }

    /// Sends a one-time progress notification.
    pub fn notify_progress(&self) {
        let inner = self.inner.read().unwrap();
        let progress = self.status.snapshot();
        for cb in &inner.callbacks {
            cb(progress.clone());
        }
    }

    /// Starts periodic progress notifications in a background tokio task.
    ///
    /// Call [`stop`](Self::stop) to cancel.
    pub fn start(&self) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        {
            let mut stop = self.stop.lock().unwrap();
            // Stop any existing task.
            drop(stop.take());
            *stop = Some(tx);
        }

        let inner = Arc::clone(&self.inner);
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            let interval = {
                let i = inner.read().unwrap();
                i.interval
            };
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let progress = status.snapshot();
                        let i = inner.read().unwrap();
                        for cb in &i.callbacks {
                            cb(progress.clone());
                        }
                    }
                    _ = &mut rx => {
                        break;
                    }
                }
            }
        });
    }

    /// Stops the periodic notification task.
    pub fn stop(&self) {
        let mut stop = self.stop.lock().unwrap();
        // Dropping the sender signals the task to exit.
        drop(stop.take());
    }
}

/// Throughput over a sliding time window of byte samples.
pub struct SpeedCalculator {
    window: Duration,
    max_samples: usize,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl SpeedCalculator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            window,
            max_samples: max_samples.max(2),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Records `bytes` moved just now.
    pub fn record(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        samples.push_back((now, bytes));
        while let Some((at, _)) = samples.front()
            && (now.duration_since(*at) > self.window || samples.len() > self.max_samples)
        {
            samples.pop_front();
        }
    }

    /// Bytes per second across the retained samples; 0 until two
    /// samples at distinct instants exist.
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        let (Some((first, _)), Some((last, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let elapsed = last.duration_since(*first);
        if elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = samples.iter().map(|(_, bytes)| bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }
}
