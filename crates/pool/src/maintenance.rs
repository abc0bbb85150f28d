//! Background maintenance
//!
//! One thread per pool runs the periodic work: `adjust` on its own
//! period (age eviction, leak reclamation, min/max sizing) and `sample`
//! on the statistics period. The thread parks on a condvar so `stop`
//! takes effect immediately instead of at the next tick.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error};

use crate::pool::ConnectionPool;

struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        StopSignal {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Park until `deadline` or until stopped; returns true if stopped.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }
}

/// Handle to a pool's maintenance thread. Stops and joins on drop.
pub struct Maintenance {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Maintenance {
    /// Spawn the maintenance thread for `pool`.
    pub fn start(pool: ConnectionPool) -> Self {
        let signal = Arc::new(StopSignal::new());
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("tidepool-maint".to_string())
            .spawn(move || run(pool, thread_signal))
            .expect("failed to spawn maintenance thread");
        Maintenance {
            signal,
            handle: Some(handle),
        }
    }

    /// Stop the thread and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(pool: ConnectionPool, signal: Arc<StopSignal>) {
    let name = pool.name().to_string();
    debug!(pool = %name, "maintenance thread started");
    let config = pool.config();
    let adjust_period = config.adjust_period();
    let sampling_period = config.sampling_period();

    let mut next_adjust = Instant::now() + adjust_period;
    let mut next_sample = Instant::now() + sampling_period;
    loop {
        let deadline = next_adjust.min(next_sample);
        if signal.wait_until(deadline) {
            break;
        }
        let now = Instant::now();
        if now >= next_adjust {
            if let Err(e) = pool.adjust() {
                // Growth failure; retried on the next tick
                error!(pool = %name, error = %e, "maintenance adjust failed");
            }
            next_adjust = now + adjust_period;
        }
        if now >= next_sample {
            pool.sample();
            next_sample = now + sampling_period;
        }
    }
    debug!(pool = %name, "maintenance thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryCoordinator, MemoryDriver};
    use std::time::Duration;
    use tidepool_core::{Credentials, Driver, PoolConfig, TransactionCoordinator};

    fn pool(config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(
            "maint",
            "mem://test",
            Credentials::new("app", "pw"),
            Arc::new(MemoryDriver::new()) as Arc<dyn Driver>,
            Arc::new(MemoryCoordinator::new()) as Arc<dyn TransactionCoordinator>,
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let config = PoolConfig {
            pool_min: 0,
            adjust_period_seconds: 3600,
            sampling_period_seconds: 3600,
            ..PoolConfig::default()
        };
        let mut maint = Maintenance::start(pool(config));
        // Stopping must not wait out the hour-long tick
        let started = Instant::now();
        maint.stop();
        maint.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_periodic_adjust_reclaims_leak() {
        let config = PoolConfig {
            pool_min: 0,
            max_open_time_minutes: 0,
            adjust_period_seconds: 1,
            sampling_period_seconds: 3600,
            max_wait_seconds: 0,
            ..PoolConfig::default()
        };
        let pool = pool(config);
        let _leaked = pool.acquire(None).unwrap();
        let _maint = Maintenance::start(pool.clone());

        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.stats().leaks == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(pool.stats().leaks, 1);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_drop_joins_thread() {
        let config = PoolConfig {
            pool_min: 0,
            adjust_period_seconds: 1,
            sampling_period_seconds: 1,
            ..PoolConfig::default()
        };
        let maint = Maintenance::start(pool(config));
        drop(maint);
    }
}
