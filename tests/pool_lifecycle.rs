//! End-to-end lifecycle tests: registry, maintenance, reclamation,
//! resizing and statistics over the public API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tidepool::testing::{MemoryCoordinator, MemoryDriver};
use tidepool::{
    ConnectionPool, Credentials, Driver, Maintenance, PoolConfig, PoolError, PoolRegistry,
    TransactionCoordinator, Value,
};

struct Fixture {
    pool: ConnectionPool,
    driver: Arc<MemoryDriver>,
    coordinator: Arc<MemoryCoordinator>,
}

fn fixture(name: &str, config: PoolConfig) -> Fixture {
    let driver = Arc::new(MemoryDriver::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let pool = ConnectionPool::new(
        name,
        "mem://test",
        Credentials::new("app", "pw"),
        Arc::clone(&driver) as Arc<dyn Driver>,
        Arc::clone(&coordinator) as Arc<dyn TransactionCoordinator>,
        config,
    )
    .unwrap();
    Fixture {
        pool,
        driver,
        coordinator,
    }
}

fn quick_config() -> PoolConfig {
    PoolConfig {
        pool_min: 0,
        pool_max: 4,
        max_wait_seconds: 0,
        ..PoolConfig::default()
    }
}

#[test]
fn registry_routes_work_to_named_pools() {
    let registry = PoolRegistry::new();
    let orders = fixture("orders", quick_config());
    let billing = fixture("billing", quick_config());
    registry.register(orders.pool.clone()).unwrap();
    registry.register(billing.pool.clone()).unwrap();

    let pool = registry.get("orders").unwrap();
    let conn = pool.acquire(None).unwrap();
    let stmt = conn.prepare("UPDATE orders SET state = ? WHERE id = ?").unwrap();
    stmt.execute(&[Value::Text("shipped".into()), Value::Int(7)])
        .unwrap();

    assert_eq!(orders.driver.execute_count(), 1);
    assert_eq!(billing.driver.execute_count(), 0);

    let removed = registry.unregister("billing").unwrap();
    removed.shutdown();
    assert!(registry.get("billing").is_none());
    // The orders pool is untouched
    drop(stmt);
    drop(conn);
    assert_eq!(orders.pool.free_count(), 1);
}

#[test]
fn background_maintenance_reclaims_leaks_and_samples() {
    let config = PoolConfig {
        pool_min: 0,
        pool_max: 4,
        max_wait_seconds: 0,
        max_open_time_minutes: 0,
        adjust_period_seconds: 1,
        sampling_period_seconds: 1,
        ..PoolConfig::default()
    };
    let fx = fixture("maint", config);
    let leaked = fx.pool.acquire(None).unwrap();
    let window_before = fx.pool.stats().window_started;

    let _maint = Maintenance::start(fx.pool.clone());
    let deadline = Instant::now() + Duration::from_secs(10);
    while fx.pool.stats().leaks == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }

    let stats = fx.pool.stats();
    assert_eq!(stats.leaks, 1);
    assert_eq!(stats.size, 0);
    assert!(stats.window_started > window_before, "sampling ticked");

    // The reclaimed handle fails fast rather than touching a dead session
    assert!(matches!(
        leaked.prepare("SELECT 1"),
        Err(PoolError::ConnectionClosed)
    ));
}

#[test]
fn transactional_work_commits_through_the_coordinator() {
    let fx = fixture("tx", quick_config());
    let tx = fx.coordinator.begin();

    let conn = fx.pool.acquire(Some(tx)).unwrap();
    let stmt = conn.prepare("INSERT INTO audit VALUES (?)").unwrap();
    stmt.execute(&[Value::Text("created".into())]).unwrap();
    stmt.close();
    conn.close();

    // Still bound: the physical connection waits for the coordinator
    assert_eq!(fx.pool.busy_count(), 1);
    fx.coordinator.complete(tx, true);
    assert_eq!(fx.pool.busy_count(), 0);
    assert_eq!(fx.pool.free_count(), 1);

    // The same physical connection serves later work, cache warm
    let conn = fx.pool.acquire(None).unwrap();
    conn.prepare("INSERT INTO audit VALUES (?)").unwrap();
    assert_eq!(fx.driver.prepared_count(), 1);
}

#[test]
fn statement_properties_reset_between_borrowers() {
    let fx = fixture("props", quick_config());

    let conn = fx.pool.acquire(None).unwrap();
    let stmt = conn.prepare("SELECT * FROM big").unwrap();
    stmt.set_fetch_size(500).unwrap();
    stmt.set_max_rows(10_000).unwrap();
    let sets = fx.driver.property_set_count();
    stmt.close();

    // Next borrower gets driver defaults back, not the tuned values
    let stmt = conn.prepare("SELECT * FROM big").unwrap();
    assert_eq!(fx.driver.property_set_count(), sets + 3);
    stmt.query(&[]).unwrap();
}

#[test]
fn resizing_live_pool() {
    let fx = fixture("resize", quick_config());

    let handles: Vec<_> = (0..4).map(|_| fx.pool.acquire(None).unwrap()).collect();
    assert!(matches!(
        fx.pool.acquire(None),
        Err(PoolError::PoolExhausted)
    ));

    // Grow, use the headroom, then shrink below current size
    fx.pool.set_pool_max(6).unwrap();
    let extra = fx.pool.acquire(None).unwrap();
    assert_eq!(fx.pool.size(), 5);

    drop(extra);
    drop(handles);
    fx.pool.set_pool_max(2).unwrap();
    assert_eq!(fx.pool.size(), 2);
    assert_eq!(fx.driver.open_count(), 2);

    // And a floor: pool_min forces connections open ahead of demand
    fx.pool.set_pool_min(2).unwrap();
    assert_eq!(fx.pool.free_count(), 2);

    let invalid = fx.pool.set_pool_max(1);
    assert!(matches!(invalid, Err(PoolError::Config(_))));
}

#[test]
fn stats_tell_the_whole_story() {
    let mut config = quick_config();
    config.pool_max = 2;
    let fx = fixture("stats", config);

    let a = fx.pool.acquire(None).unwrap();
    let b = fx.pool.acquire(None).unwrap();
    let denied = fx.pool.acquire(None);
    assert!(denied.is_err());
    drop(a);
    drop(b);

    let stats = fx.pool.stats();
    assert_eq!(stats.served, 2);
    assert_eq!(stats.opened, 2);
    assert_eq!(stats.rejected_full, 1);
    assert_eq!(stats.busy_high, 2);
    assert_eq!(stats.size, 2);
    assert_eq!(stats.free, 2);
    assert_eq!(stats.busy, 0);

    fx.pool.sample();
    let after = fx.pool.stats();
    assert_eq!(after.busy_high, 0);
    assert_eq!(after.served, 2);
    assert_eq!(after.rejected_full, 1);
}

#[test]
fn shutdown_drains_cleanly() {
    let fx = fixture("drain", quick_config());
    let held = fx.pool.acquire(None).unwrap();
    let idle = fx.pool.acquire(None).unwrap();
    drop(idle);

    fx.pool.shutdown();
    // Free connections die immediately, held ones on return
    assert_eq!(fx.driver.open_count(), 1);
    drop(held);
    assert_eq!(fx.driver.open_count(), 0);
    assert_eq!(fx.pool.size(), 0);
    assert!(matches!(fx.pool.acquire(None), Err(PoolError::PoolClosed)));
    // Shutdown is idempotent
    fx.pool.shutdown();
}

#[test]
fn per_caller_credentials_only_affect_new_connections() {
    let fx = fixture("creds", quick_config());

    let conn = fx
        .pool
        .acquire_as(&Credentials::new("reporting", "ro-pw"), None)
        .unwrap();
    drop(conn);
    // Reuse does not re-authenticate
    let conn = fx
        .pool
        .acquire_as(&Credentials::new("reporting", "ro-pw"), None)
        .unwrap();
    drop(conn);
    assert_eq!(fx.driver.connect_count(), 1);
}
