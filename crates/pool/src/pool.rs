//! Pool core: free/full sets, transaction affinity, waiter protocol
//!
//! All pool bookkeeping lives in one `PoolInner` behind a single
//! `parking_lot::Mutex` with an associated `Condvar`. Acquire, release,
//! transaction completion, adjustment and capacity reconfiguration all
//! run under that lock; blocking happens only inside the waiter loop,
//! bounded by `max_wait` and admission-controlled by `max_waiters`.
//!
//! The free set is ordered by `(reuse_hits, id)`: hand-out pops the
//! most-reused connection so warm statement caches stay warm, while
//! shrinking pops the least-reused first. Age eviction scans the whole
//! free set independently of that order, so a low-traffic connection
//! cannot dodge its age limit.
//!
//! Enlistment with the transaction coordinator happens *outside* the
//! pool lock. The transaction→connection mapping is reserved, as
//! pending, in the same critical section that hands out the connection;
//! a concurrent acquire for the same transaction blocks until the
//! enlistment resolves and is served only once the mapping is bound.
//! A handle is therefore never handed out over a connection whose
//! enlistment did not succeed.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tidepool_core::{
    Credentials, Driver, EnlistOutcome, PoolConfig, PoolError, Result, TransactionCoordinator,
    TxId,
};
use tracing::{debug, error, info, warn};

use crate::handle::LogicalHandle;
use crate::managed::{DestroyReason, ManagedConnection};
use crate::stats::{PoolStats, StatCounters};

/// Aged connections destroyed per adjust pass. Bounds the work done
/// under the pool lock so maintenance never starves waiters for long.
const EVICT_BATCH: usize = 3;

/// Upper bound on waiting out another caller's in-flight enlistment of
/// the same transaction when `max_wait` is zero. A zero `max_wait`
/// disables waiting for capacity; an enlistment already in flight
/// resolves internally and is waited out regardless.
const ENLIST_RESOLVE_WAIT: Duration = Duration::from_secs(5);

/// Mapping from a transaction to its physical connection. `Pending`
/// lives from hand-out until enlistment resolves; the affinity path
/// serves only `Bound` mappings.
#[derive(Debug, Clone, Copy)]
enum TxBinding {
    Pending(u64),
    Bound(u64),
}

impl TxBinding {
    fn connection_id(self) -> u64 {
        match self {
            TxBinding::Pending(id) | TxBinding::Bound(id) => id,
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    /// Connections not currently held, keyed by `(reuse_hits, id)`
    free: BTreeMap<(u64, u64), Arc<ManagedConnection>>,
    /// Every open physical connection, superset of `free`
    all: HashMap<u64, Arc<ManagedConnection>>,
    /// Transaction → physical connection; at most one each way
    tx_map: HashMap<TxId, TxBinding>,
    /// Callers currently blocked in acquire
    waiters: usize,
    next_id: u64,
    closed: bool,
    stats: StatCounters,
    window_started: DateTime<Utc>,
}

impl PoolInner {
    fn busy(&self) -> usize {
        self.all.len() - self.free.len()
    }

    fn note_busy(&mut self) {
        let busy = self.busy();
        self.stats.note_busy(busy);
    }

    fn insert_free(&mut self, conn: Arc<ManagedConnection>) {
        conn.mark_free();
        self.free.insert((conn.reuse_hits(), conn.id()), conn);
    }
}

pub(crate) struct PoolShared {
    name: String,
    url: String,
    credentials: Credentials,
    driver: Arc<dyn Driver>,
    coordinator: Arc<dyn TransactionCoordinator>,
    inner: Mutex<PoolInner>,
    available: Condvar,
}

/// Transactional pooled-connection manager
///
/// Cheaply cloneable; all clones share the same pool state.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool and eagerly grow it to `pool_min`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the backend cannot
    /// supply the minimum number of connections.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        credentials: Credentials,
        driver: Arc<dyn Driver>,
        coordinator: Arc<dyn TransactionCoordinator>,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let shared = Arc::new(PoolShared {
            name: name.clone(),
            url: url.into(),
            credentials,
            driver,
            coordinator,
            inner: Mutex::new(PoolInner {
                config,
                free: BTreeMap::new(),
                all: HashMap::new(),
                tx_map: HashMap::new(),
                waiters: 0,
                next_id: 1,
                closed: false,
                stats: StatCounters::new(),
                window_started: Utc::now(),
            }),
            available: Condvar::new(),
        });
        let pool = ConnectionPool { shared };
        pool.adjust()?;
        info!(pool = %name, "connection pool created");
        Ok(pool)
    }

    /// Pool name as registered
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> PoolConfig {
        self.shared.inner.lock().config.clone()
    }

    /// Acquire a logical connection using the pool's own credentials.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::acquire_as`].
    pub fn acquire(&self, tx: Option<TxId>) -> Result<LogicalHandle> {
        let credentials = self.shared.credentials.clone();
        self.shared.acquire(&credentials, tx)
    }

    /// Acquire a logical connection, authenticating new physical
    /// connections with the given credentials.
    ///
    /// With `tx` set, every acquire for the same transaction is served
    /// by the same physical connection, enlisted exactly once.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted`: at capacity with waiting disabled or the
    ///   waiter limit reached
    /// - `AcquireTimeout`: waited the full `max_wait` without capacity
    /// - `BackendUnavailable`: opening a new physical connection failed
    /// - `Enlistment`: the coordinator rejected the resource
    /// - `PoolClosed`: the pool has been shut down
    pub fn acquire_as(&self, credentials: &Credentials, tx: Option<TxId>) -> Result<LogicalHandle> {
        self.shared.acquire(credentials, tx)
    }

    /// One maintenance pass: evict aged free connections (bounded
    /// batch), reclaim leaked connections, shrink after a capacity
    /// reduction, and grow up to `pool_min`.
    ///
    /// # Errors
    ///
    /// Fails only when growing to `pool_min` fails, which is a systemic backend
    /// problem the caller must see.
    pub fn adjust(&self) -> Result<()> {
        self.shared.adjust()
    }

    /// Reset the recent-window statistics marks.
    pub fn sample(&self) {
        let mut inner = self.shared.inner.lock();
        let busy = inner.busy();
        let waiters = inner.waiters;
        inner.stats.reset_window(busy, waiters);
        inner.window_started = Utc::now();
    }

    /// Exact counters and live gauges.
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            served: inner.stats.served,
            opened: inner.stats.opened,
            rejected_full: inner.stats.rejected_full,
            rejected_timeout: inner.stats.rejected_timeout,
            rejected_other: inner.stats.rejected_other,
            connection_failures: inner.stats.connection_failures,
            leaks: inner.stats.leaks,
            waiting_total_ms: inner.stats.waiting_total_ms,
            waiting_acquires: inner.stats.waiting_acquires,
            busy_high: inner.stats.busy_high,
            busy_low: inner.stats.busy_low,
            waiter_high: inner.stats.waiter_high,
            waiting_high_ms: inner.stats.waiting_high_ms,
            size: inner.all.len(),
            free: inner.free.len(),
            busy: inner.busy(),
            waiters: inner.waiters,
            window_started: inner.window_started,
        }
    }

    /// Open physical connections right now
    pub fn size(&self) -> usize {
        self.shared.inner.lock().all.len()
    }

    /// Free physical connections right now
    pub fn free_count(&self) -> usize {
        self.shared.inner.lock().free.len()
    }

    /// Held physical connections right now
    pub fn busy_count(&self) -> usize {
        self.shared.inner.lock().busy()
    }

    /// Callers blocked in acquire right now
    pub fn waiter_count(&self) -> usize {
        self.shared.inner.lock().waiters
    }

    /// Change the pool's upper capacity bound and re-adjust.
    ///
    /// Lowering below the current size shrinks the free set; held
    /// connections are never destroyed by a capacity change.
    ///
    /// # Errors
    ///
    /// Fails if the new value is inconsistent with the rest of the
    /// configuration, or if re-adjustment cannot grow to `pool_min`.
    pub fn set_pool_max(&self, pool_max: usize) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            let mut config = inner.config.clone();
            config.pool_max = pool_max;
            config.validate()?;
            inner.config = config;
            // Raised capacity may unblock waiters
            self.shared.available.notify_all();
        }
        self.adjust()
    }

    /// Change the pool's minimum size and re-adjust.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ConnectionPool::set_pool_max`].
    pub fn set_pool_min(&self, pool_min: usize) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            let mut config = inner.config.clone();
            config.pool_min = pool_min;
            config.validate()?;
            inner.config = config;
        }
        self.adjust()
    }

    /// Shut the pool down: destroy free connections, reject new
    /// acquires, and wake every waiter. Held connections are destroyed
    /// as their handles come back.
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let free = std::mem::take(&mut inner.free);
        for (_, conn) in free {
            inner.all.remove(&conn.id());
            conn.destroy(DestroyReason::Shutdown);
        }
        self.shared.available.notify_all();
        info!(pool = %self.shared.name, "connection pool shut down");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ConnectionPool")
            .field("name", &self.shared.name)
            .field("size", &inner.all.len())
            .field("free", &inner.free.len())
            .field("waiters", &inner.waiters)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl PoolShared {
    fn acquire(self: &Arc<Self>, credentials: &Credentials, tx: Option<TxId>) -> Result<LogicalHandle> {
        let started = Instant::now();
        let mut did_wait = false;
        let mut wait_deadline: Option<Instant> = None;

        let mut inner = self.inner.lock();
        let conn = loop {
            if inner.closed {
                return Err(PoolError::PoolClosed);
            }

            // Transaction affinity: same transaction, same physical
            // connection, already enlisted. A pending mapping means
            // another caller's enlistment is still in flight; wait for
            // it to resolve rather than serving an un-enlisted
            // connection or grabbing a second one for the transaction.
            if let Some(tx) = tx {
                match inner.tx_map.get(&tx).copied() {
                    Some(TxBinding::Bound(id)) => match inner.all.get(&id).cloned() {
                        Some(conn) if !conn.is_destroyed() => {
                            conn.mark_held();
                            inner.stats.served += 1;
                            if did_wait {
                                inner.stats.note_wait(started.elapsed().as_millis() as u64);
                            }
                            inner.note_busy();
                            drop(inner);
                            return Ok(LogicalHandle::new(conn, Arc::downgrade(self)));
                        }
                        _ => {
                            warn!(%tx, "dropping stale transaction mapping");
                            inner.tx_map.remove(&tx);
                        }
                    },
                    Some(TxBinding::Pending(_)) => {
                        let max_wait = inner.config.max_wait();
                        let bound = if max_wait.is_zero() {
                            ENLIST_RESOLVE_WAIT
                        } else {
                            max_wait
                        };
                        let deadline =
                            *wait_deadline.get_or_insert_with(|| Instant::now() + bound);
                        if Instant::now() >= deadline {
                            inner.stats.rejected_timeout += 1;
                            return Err(PoolError::AcquireTimeout {
                                waited_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                        did_wait = true;
                        self.available.wait_until(&mut inner, deadline);
                        continue;
                    }
                    None => {}
                }
            }

            // Hand out the most-reused free connection.
            let check_level = inner.config.check_level;
            let test_statement = if check_level >= 2 {
                inner.config.test_statement.clone()
            } else {
                None
            };
            if let Some((_, conn)) = inner.free.pop_last() {
                if check_level > 0 {
                    if let Err(e) = conn.probe(test_statement.as_deref()) {
                        warn!(id = conn.id(), error = %e, "health check failed; destroying connection");
                        inner.all.remove(&conn.id());
                        conn.destroy(DestroyReason::ProbeFailed);
                        continue;
                    }
                }
                conn.mark_held();
                break conn;
            }

            // Room to grow: open a new physical connection.
            let capacity_left = inner
                .config
                .pool_max_limit()
                .map_or(true, |max| inner.all.len() < max);
            if capacity_left {
                match self.create_connection(&mut inner, credentials) {
                    Ok(conn) => {
                        conn.mark_held();
                        break conn;
                    }
                    Err(e) => {
                        inner.stats.connection_failures += 1;
                        inner.stats.rejected_other += 1;
                        return Err(e);
                    }
                }
            }

            // Full and nothing free: wait, if the config allows it.
            let max_wait = inner.config.max_wait();
            if max_wait.is_zero() {
                inner.stats.rejected_full += 1;
                return Err(PoolError::PoolExhausted);
            }
            let deadline = *wait_deadline.get_or_insert_with(|| Instant::now() + max_wait);
            if Instant::now() >= deadline {
                inner.stats.rejected_timeout += 1;
                return Err(PoolError::AcquireTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            if inner.waiters >= inner.config.max_waiters {
                inner.stats.rejected_full += 1;
                return Err(PoolError::PoolExhausted);
            }
            inner.waiters += 1;
            let waiters = inner.waiters;
            inner.stats.note_waiters(waiters);
            did_wait = true;
            // Spurious wakeups are fine: the loop re-checks everything
            // and the deadline is recomputed from wall time.
            self.available.wait_until(&mut inner, deadline);
            inner.waiters -= 1;
        };

        // Reserve the transaction mapping while still under the lock so
        // a concurrent acquire for the same transaction blocks on this
        // connection instead of taking another. The mapping stays
        // pending until enlistment resolves.
        if let Some(tx) = tx {
            inner.tx_map.insert(tx, TxBinding::Pending(conn.id()));
            conn.bind_tx(tx);
        }
        drop(inner);

        // Enlistment runs outside the pool lock: the coordinator may
        // fire completion callbacks from other threads, and those
        // callbacks take the pool lock.
        let mut enlisted = false;
        if let Some(tx) = tx {
            match self.coordinator.enlist(tx, conn.two_phase()) {
                Ok(EnlistOutcome::Enlisted) | Ok(EnlistOutcome::RollbackOnly) => {
                    if let Err(e) = conn.set_auto_commit(false) {
                        self.discard_broken(&conn, tx);
                        return Err(e);
                    }
                    let weak = Arc::downgrade(self);
                    let registered = self.coordinator.register_completion(
                        tx,
                        Box::new(move |done| {
                            if let Some(shared) = weak.upgrade() {
                                shared.on_transaction_complete(done);
                            }
                        }),
                    );
                    if let Err(e) = registered {
                        // The resource is already enlisted and the
                        // coordinator will still drive it; the
                        // connection can never go back into circulation.
                        self.discard_broken(&conn, tx);
                        return Err(enlist_error(e));
                    }
                    enlisted = true;
                    debug!(id = conn.id(), %tx, "connection enlisted");
                }
                Ok(EnlistOutcome::AlreadyCompleted) => {
                    // The transaction finished before we could join it;
                    // serve the connection in auto-commit mode instead.
                    self.unbind(&conn, tx);
                    if let Err(e) = conn.set_auto_commit(true) {
                        self.discard_broken(&conn, tx);
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.fail_enlisted(&conn, tx);
                    return Err(enlist_error(e));
                }
            }
        } else if let Err(e) = conn.set_auto_commit(true) {
            self.discard_broken(&conn, TxId::new());
            return Err(e);
        }

        let mut inner = self.inner.lock();
        if enlisted {
            if let Some(tx) = tx {
                // A completion callback may already have removed the
                // mapping; only an entry still present is promoted.
                if let Some(binding) = inner.tx_map.get_mut(&tx) {
                    *binding = TxBinding::Bound(conn.id());
                }
            }
            self.available.notify_all();
        }
        inner.stats.served += 1;
        if did_wait {
            inner.stats.note_wait(started.elapsed().as_millis() as u64);
        }
        inner.note_busy();
        drop(inner);
        Ok(LogicalHandle::new(conn, Arc::downgrade(self)))
    }

    fn create_connection(
        &self,
        inner: &mut PoolInner,
        credentials: &Credentials,
    ) -> Result<Arc<ManagedConnection>> {
        let id = inner.next_id;
        inner.next_id += 1;
        let driver_conn = self
            .driver
            .connect(&self.url, credentials)
            .map_err(|e| PoolError::BackendUnavailable(e.to_string()))?;
        let conn = Arc::new(ManagedConnection::new(
            id,
            driver_conn,
            inner.config.pstmt_max,
        ));
        inner.all.insert(id, Arc::clone(&conn));
        inner.stats.opened += 1;
        debug!(id, pool = %self.name, "opened physical connection");
        Ok(conn)
    }

    /// Return a logical hold. With no bound transaction the connection
    /// goes straight back to the free set and one waiter is woken; with
    /// a transaction it stays busy until the completion callback.
    pub(crate) fn release(&self, conn: &Arc<ManagedConnection>) {
        let mut inner = self.inner.lock();
        let rel = conn.release_hold();
        if rel.underflow {
            warn!(id = conn.id(), "double release of pooled connection");
            return;
        }
        if rel.hold_count == 0 && rel.bound_tx.is_none() {
            if inner.closed {
                inner.all.remove(&conn.id());
                conn.destroy(DestroyReason::Shutdown);
            } else if !conn.is_destroyed() {
                inner.insert_free(Arc::clone(conn));
                self.available.notify_one();
            }
            // A destroyed connection (leak reclaim) was already removed
            // from the full set; nothing left to do.
        }
        inner.note_busy();
    }

    /// Completion callback target. The commit/rollback outcome has
    /// already been driven by the coordinator; the pool only needs to
    /// drop the affinity mapping and free the connection once the last
    /// of {transaction completion, caller close} has happened.
    pub(crate) fn on_transaction_complete(&self, tx: TxId) {
        let mut inner = self.inner.lock();
        let Some(binding) = inner.tx_map.remove(&tx) else {
            debug!(%tx, "completion for unknown transaction");
            return;
        };
        let Some(conn) = inner.all.get(&binding.connection_id()).cloned() else {
            return;
        };
        let remaining = conn.clear_tx();
        if remaining == 0 && !conn.is_destroyed() {
            if inner.closed {
                inner.all.remove(&conn.id());
                conn.destroy(DestroyReason::Shutdown);
            } else {
                inner.insert_free(conn);
                self.available.notify_one();
            }
        }
        inner.note_busy();
    }

    fn adjust(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let max_age = inner.config.max_age();
        let max_open_time = inner.config.max_open_time();
        let pool_min = inner.config.pool_min;

        // Aged free connections, bounded batch. The scan ignores the
        // reuse ordering so low-traffic connections age out too.
        let aged: Vec<(u64, u64)> = inner
            .free
            .iter()
            .filter(|(_, conn)| conn.is_aged(max_age))
            .map(|(key, _)| *key)
            .take(EVICT_BATCH)
            .collect();
        for key in aged {
            if inner.all.len() <= pool_min {
                break;
            }
            if let Some(conn) = inner.free.remove(&key) {
                inner.all.remove(&conn.id());
                conn.destroy(DestroyReason::Aged);
            }
        }

        // Leaked connections: held too long with no transaction. No
        // batch limit; a leak is a caller bug and holds capacity hostage.
        let leaked: Vec<Arc<ManagedConnection>> = inner
            .all
            .values()
            .filter(|conn| conn.is_leaked(max_open_time))
            .cloned()
            .collect();
        for conn in leaked {
            warn!(id = conn.id(), pool = %self.name, "reclaiming leaked connection");
            inner.all.remove(&conn.id());
            conn.destroy(DestroyReason::Leaked);
            inner.stats.leaks += 1;
            self.available.notify_one();
        }

        // Shrink after a capacity reduction. Only free connections are
        // candidates; held ones are never destroyed by a config change.
        if let Some(max) = inner.config.pool_max_limit() {
            while inner.all.len() > max && inner.all.len() > pool_min {
                let Some((_, conn)) = inner.free.pop_first() else {
                    break;
                };
                inner.all.remove(&conn.id());
                conn.destroy(DestroyReason::Shrunk);
            }
        }

        // Grow to the minimum. Failure here is systemic and surfaced.
        while inner.all.len() < pool_min {
            match self.create_connection(&mut inner, &self.credentials) {
                Ok(conn) => {
                    inner.insert_free(conn);
                    self.available.notify_one();
                }
                Err(e) => {
                    inner.stats.connection_failures += 1;
                    error!(pool = %self.name, error = %e, "failed to grow pool to minimum");
                    return Err(e);
                }
            }
        }

        inner.note_busy();
        Ok(())
    }

    /// Drop an optimistic transaction reservation without penalty.
    fn unbind(&self, conn: &Arc<ManagedConnection>, tx: TxId) {
        let mut inner = self.inner.lock();
        inner.tx_map.remove(&tx);
        drop(inner);
        conn.clear_tx();
        // Wake affinity waiters blocked on the pending mapping
        self.available.notify_all();
    }

    /// Enlistment itself failed on a healthy connection: put it back.
    /// Waiters blocked on the pending mapping re-evaluate from scratch.
    fn fail_enlisted(&self, conn: &Arc<ManagedConnection>, tx: TxId) {
        let mut inner = self.inner.lock();
        inner.tx_map.remove(&tx);
        conn.clear_tx();
        let rel = conn.release_hold();
        if rel.hold_count == 0 && !conn.is_destroyed() && !inner.closed {
            inner.insert_free(Arc::clone(conn));
        }
        inner.stats.rejected_other += 1;
        inner.note_busy();
        self.available.notify_all();
    }

    /// The connection cannot be trusted or reused: drop it entirely.
    fn discard_broken(&self, conn: &Arc<ManagedConnection>, tx: TxId) {
        let mut inner = self.inner.lock();
        inner.tx_map.remove(&tx);
        conn.clear_tx();
        inner.all.remove(&conn.id());
        inner.stats.connection_failures += 1;
        inner.stats.rejected_other += 1;
        conn.destroy(DestroyReason::Errored);
        self.available.notify_all();
        inner.note_busy();
    }
}

/// Coordinator failures surface as `Enlistment`; an error that already
/// is one passes through unwrapped.
fn enlist_error(e: PoolError) -> PoolError {
    match e {
        PoolError::Enlistment(_) => e,
        other => PoolError::Enlistment(other.to_string()),
    }
}
