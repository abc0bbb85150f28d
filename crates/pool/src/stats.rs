//! Pool statistics
//!
//! Running counters are exact and monotonic; they live under the pool
//! lock and are bumped by the operation that owns the event, never
//! sampled or estimated. The "recent window" high-water marks are the
//! only values `sample()` resets.

use chrono::{DateTime, Utc};

/// Counters kept under the pool lock
#[derive(Debug, Clone)]
pub(crate) struct StatCounters {
    /// Logical connections handed out
    pub served: u64,
    /// Physical connections opened
    pub opened: u64,
    /// Acquires rejected immediately (no waiting, or waiter limit hit)
    pub rejected_full: u64,
    /// Acquires that waited and timed out
    pub rejected_timeout: u64,
    /// Acquires that failed for backend or enlistment reasons
    pub rejected_other: u64,
    /// Physical connection creation failures
    pub connection_failures: u64,
    /// Leaked connections reclaimed by adjust
    pub leaks: u64,
    /// Total milliseconds spent blocked in acquire
    pub waiting_total_ms: u64,
    /// Number of acquires that blocked at least once
    pub waiting_acquires: u64,

    // Recent-window marks, reset by sample()
    pub busy_high: usize,
    pub busy_low: usize,
    pub waiter_high: usize,
    pub waiting_high_ms: u64,
}

impl StatCounters {
    pub fn new() -> Self {
        StatCounters {
            served: 0,
            opened: 0,
            rejected_full: 0,
            rejected_timeout: 0,
            rejected_other: 0,
            connection_failures: 0,
            leaks: 0,
            waiting_total_ms: 0,
            waiting_acquires: 0,
            busy_high: 0,
            busy_low: 0,
            waiter_high: 0,
            waiting_high_ms: 0,
        }
    }

    /// Fold the current busy count into the window marks.
    pub fn note_busy(&mut self, busy: usize) {
        if busy > self.busy_high {
            self.busy_high = busy;
        }
        if busy < self.busy_low {
            self.busy_low = busy;
        }
    }

    /// Fold the current waiter count into the window mark.
    pub fn note_waiters(&mut self, waiters: usize) {
        if waiters > self.waiter_high {
            self.waiter_high = waiters;
        }
    }

    /// Record one acquire that blocked for `waited_ms`.
    pub fn note_wait(&mut self, waited_ms: u64) {
        self.waiting_acquires += 1;
        self.waiting_total_ms += waited_ms;
        if waited_ms > self.waiting_high_ms {
            self.waiting_high_ms = waited_ms;
        }
    }

    /// Start a fresh window anchored at the current gauges.
    pub fn reset_window(&mut self, busy: usize, waiters: usize) {
        self.busy_high = busy;
        self.busy_low = busy;
        self.waiter_high = waiters;
        self.waiting_high_ms = 0;
    }
}

/// Point-in-time snapshot of one pool's statistics and gauges
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Logical connections handed out since pool creation
    pub served: u64,
    /// Physical connections opened since pool creation
    pub opened: u64,
    /// Immediate rejections (pool full, waiting unavailable)
    pub rejected_full: u64,
    /// Rejections after a timed-out wait
    pub rejected_timeout: u64,
    /// Rejections for backend or enlistment failures
    pub rejected_other: u64,
    /// Physical connection creation failures
    pub connection_failures: u64,
    /// Leaked connections reclaimed
    pub leaks: u64,
    /// Total milliseconds callers spent blocked in acquire
    pub waiting_total_ms: u64,
    /// Acquires that blocked at least once
    pub waiting_acquires: u64,
    /// Highest busy count in the current window
    pub busy_high: usize,
    /// Lowest busy count in the current window
    pub busy_low: usize,
    /// Highest waiter count in the current window
    pub waiter_high: usize,
    /// Longest blocked acquire in the current window, milliseconds
    pub waiting_high_ms: u64,
    /// Open physical connections right now
    pub size: usize,
    /// Free physical connections right now
    pub free: usize,
    /// Held physical connections right now
    pub busy: usize,
    /// Callers blocked in acquire right now
    pub waiters: usize,
    /// When the current sampling window started
    pub window_started: DateTime<Utc>,
}
