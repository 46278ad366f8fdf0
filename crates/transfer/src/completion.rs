use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Countdown of outstanding work units for one object.
///
/// Armed once with `blocks + 1` (the extra unit is the metadata step).
/// The caller whose [`signal`](Self::signal) brings it to zero is the
/// single owner of the "object finished" transition.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    initial: AtomicU64,
    remaining: AtomicU64,
    armed: AtomicBool,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the countdown. Only the first call has an effect.
    pub fn arm(&self, count: u64) -> bool {
        if self.armed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.initial.store(count, Ordering::Release);
        self.remaining.store(count, Ordering::Release);
        true
    }

    /// Decrements by one. Returns `true` for the call that reaches zero.
    ///
    /// Signalling an exhausted or unarmed counter is a no-op.
    pub fn signal(&self) -> bool {
        if !self.armed.load(Ordering::Acquire) {
            return false;
        }
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn initial(&self) -> u64 {
        self.initial.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.is_armed() && self.remaining() == 0
    }
}
