//! Concurrency tests for the pool's waiting protocol and transaction
//! affinity under real thread contention.

use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use tidepool::testing::{MemoryCoordinator, MemoryDriver};
use tidepool::{
    ConnectionPool, Credentials, Driver, PoolConfig, PoolError, TransactionCoordinator,
};

fn build_pool(config: PoolConfig) -> (ConnectionPool, Arc<MemoryCoordinator>) {
    let coordinator = Arc::new(MemoryCoordinator::new());
    let pool = ConnectionPool::new(
        "contended",
        "mem://test",
        Credentials::new("app", "pw"),
        Arc::new(MemoryDriver::new()) as Arc<dyn Driver>,
        Arc::clone(&coordinator) as Arc<dyn TransactionCoordinator>,
        config,
    )
    .unwrap();
    (pool, coordinator)
}

#[test]
fn waiter_limit_rejects_overflow_and_serves_the_rest() {
    let config = PoolConfig {
        pool_min: 0,
        pool_max: 1,
        max_wait_seconds: 10,
        max_waiters: 2,
        ..PoolConfig::default()
    };
    let (pool, _) = build_pool(config);

    let held = pool.acquire(None).unwrap();
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                match pool.acquire(None) {
                    Ok(handle) => {
                        std::thread::sleep(Duration::from_millis(10));
                        drop(handle);
                        true
                    }
                    Err(PoolError::PoolExhausted) => false,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            })
        })
        .collect();

    barrier.wait();
    // Let all three reach the full-pool decision point
    std::thread::sleep(Duration::from_millis(200));
    drop(held);

    let outcomes: Vec<bool> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let served = outcomes.iter().filter(|ok| **ok).count();
    assert_eq!(served, 2, "two waiters admitted, one rejected");
    assert_eq!(pool.stats().rejected_full, 1);
    assert_eq!(pool.waiter_count(), 0);
    assert_eq!(pool.busy_count(), 0);
}

#[test]
fn acquire_times_out_after_max_wait() {
    let config = PoolConfig {
        pool_min: 0,
        pool_max: 1,
        max_wait_seconds: 1,
        ..PoolConfig::default()
    };
    let (pool, _) = build_pool(config);

    let _held = pool.acquire(None).unwrap();
    let started = Instant::now();
    let err = pool.acquire(None).unwrap_err();
    let elapsed = started.elapsed();

    match err {
        PoolError::AcquireTimeout { waited_ms } => {
            assert!(waited_ms >= 900, "reported {waited_ms}ms");
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(pool.stats().rejected_timeout, 1);
}

#[test]
fn release_wakes_a_waiter_promptly() {
    let config = PoolConfig {
        pool_min: 0,
        pool_max: 1,
        max_wait_seconds: 10,
        ..PoolConfig::default()
    };
    let (pool, _) = build_pool(config);

    let held = pool.acquire(None).unwrap();
    let waiter = {
        let pool = pool.clone();
        std::thread::spawn(move || {
            let started = Instant::now();
            let handle = pool.acquire(None).unwrap();
            drop(handle);
            started.elapsed()
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    drop(held);
    let waited = waiter.join().unwrap();
    // Woken by the release, nowhere near the 10s limit
    assert!(waited < Duration::from_secs(5));

    let stats = pool.stats();
    assert_eq!(stats.served, 2);
    assert_eq!(stats.waiting_acquires, 1);
    assert!(stats.waiting_high_ms > 0);
    assert_eq!(stats.waiter_high, 1);
}

#[test]
fn concurrent_acquires_for_one_transaction_share_a_connection() {
    let config = PoolConfig {
        pool_min: 0,
        pool_max: 4,
        max_wait_seconds: 10,
        ..PoolConfig::default()
    };
    let (pool, coordinator) = build_pool(config);
    let tx = coordinator.begin();

    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let handle = pool.acquire(Some(tx)).unwrap();
                let id = handle.connection_id();
                std::thread::sleep(Duration::from_millis(5));
                id
            })
        })
        .collect();

    let ids: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    // One physical connection was enlisted exactly once
    assert_eq!(coordinator.enlisted_count(tx), 1);

    coordinator.complete(tx, true);
    assert_eq!(pool.busy_count(), 0);
    assert_eq!(pool.free_count(), 1);
}

#[test]
fn conservation_holds_under_stress() {
    let config = PoolConfig {
        pool_min: 0,
        pool_max: 3,
        max_wait_seconds: 30,
        max_waiters: 64,
        ..PoolConfig::default()
    };
    let (pool, _) = build_pool(config);

    let threads = 8;
    let iterations = 50;
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0..iterations {
                    let handle = pool.acquire(None).unwrap();
                    let stmt = handle.prepare("SELECT 1").unwrap();
                    stmt.query(&[(i as i64).into()]).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.served, (threads * iterations) as u64);
    assert_eq!(stats.busy, 0);
    assert!(stats.size <= 3);
    assert_eq!(stats.busy, stats.size - stats.free);
    assert!(stats.opened <= 3);
}

#[test]
fn raising_pool_max_unblocks_waiters() {
    let config = PoolConfig {
        pool_min: 0,
        pool_max: 1,
        max_wait_seconds: 10,
        ..PoolConfig::default()
    };
    let (pool, _) = build_pool(config);

    let _held = pool.acquire(None).unwrap();
    let waiter = {
        let pool = pool.clone();
        std::thread::spawn(move || pool.acquire(None).map(|h| h.connection_id()))
    };

    std::thread::sleep(Duration::from_millis(100));
    pool.set_pool_max(2).unwrap();
    // The waiter opens the second connection instead of timing out
    waiter.join().unwrap().unwrap();
    assert_eq!(pool.size(), 2);
}

#[test]
fn shutdown_wakes_blocked_waiters_with_pool_closed() {
    let config = PoolConfig {
        pool_min: 0,
        pool_max: 1,
        max_wait_seconds: 30,
        ..PoolConfig::default()
    };
    let (pool, _) = build_pool(config);

    let _held = pool.acquire(None).unwrap();
    let waiter = {
        let pool = pool.clone();
        std::thread::spawn(move || pool.acquire(None))
    };

    std::thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    pool.shutdown();
    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(PoolError::PoolClosed)));
    assert!(started.elapsed() < Duration::from_secs(5));
}
