//! In-memory driver and coordinator for tests
//!
//! `MemoryDriver` stands in for a real database client: it counts every
//! interesting call and can be told to fail connects or pings.
//! `MemoryCoordinator` is a minimal but honest transaction coordinator.
//! It drives the two-phase protocol on completion and invokes
//! registered callbacks only after dropping its own lock, exactly the
//! contract real coordinators must honor.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tidepool_core::{
    CompletionCallback, Credentials, Driver, DriverConnection, DriverStatement, EnlistOutcome,
    PoolError, Result, Row, TransactionCoordinator, TwoPhaseResource, TxId, Value, Vote,
};
use tracing::warn;

#[derive(Default)]
struct DriverState {
    connects: AtomicU64,
    open: AtomicU64,
    prepared: AtomicU64,
    executes: AtomicU64,
    pings: AtomicU64,
    property_sets: AtomicU64,
    next_resource_id: AtomicU64,
    fail_connects: AtomicBool,
    fail_pings: AtomicBool,
    fail_next_pings: AtomicU64,
}

/// Counting in-memory driver
#[derive(Default)]
pub struct MemoryDriver {
    state: Arc<DriverState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver::default()
    }

    /// Successful connect calls so far
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open (connected minus closed)
    pub fn open_count(&self) -> u64 {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Statements compiled so far across all connections
    pub fn prepared_count(&self) -> u64 {
        self.state.prepared.load(Ordering::SeqCst)
    }

    /// `execute` calls so far across all statements
    pub fn execute_count(&self) -> u64 {
        self.state.executes.load(Ordering::SeqCst)
    }

    /// Pings answered so far
    pub fn ping_count(&self) -> u64 {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Property setter calls (fetch size, max rows, timeout) so far
    pub fn property_set_count(&self) -> u64 {
        self.state.property_sets.load(Ordering::SeqCst)
    }

    /// Make every future connect fail
    pub fn set_fail_connects(&self, fail: bool) {
        self.state.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Make every future ping fail
    pub fn set_fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Make exactly the next `n` pings fail, then recover
    pub fn fail_next_pings(&self, n: u64) {
        self.state.fail_next_pings.store(n, Ordering::SeqCst);
    }
}

impl Driver for MemoryDriver {
    fn connect(&self, _url: &str, _credentials: &Credentials) -> Result<Box<dyn DriverConnection>> {
        if self.state.fail_connects.load(Ordering::SeqCst) {
            return Err(PoolError::Driver("connect refused".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.open.fetch_add(1, Ordering::SeqCst);
        let resource_id = self.state.next_resource_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            resource: Arc::new(MemoryResource { id: resource_id }),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    state: Arc<DriverState>,
    resource: Arc<MemoryResource>,
    closed: bool,
}

impl DriverConnection for MemoryConnection {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn DriverStatement>> {
        if self.closed {
            return Err(PoolError::ConnectionClosed);
        }
        self.state.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStatement {
            state: Arc::clone(&self.state),
            sql: sql.to_string(),
            closed: false,
        }))
    }

    fn set_auto_commit(&mut self, _enabled: bool) -> Result<()> {
        if self.closed {
            return Err(PoolError::ConnectionClosed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn ping(&mut self) -> Result<()> {
        if self.closed {
            return Err(PoolError::ConnectionClosed);
        }
        let burst = self.state.fail_next_pings.load(Ordering::SeqCst);
        if burst > 0 {
            self.state.fail_next_pings.store(burst - 1, Ordering::SeqCst);
            return Err(PoolError::Driver("ping failed".to_string()));
        }
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(PoolError::Driver("ping failed".to_string()));
        }
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn two_phase(&self) -> Arc<dyn TwoPhaseResource> {
        Arc::clone(&self.resource) as Arc<dyn TwoPhaseResource>
    }
}

struct MemoryStatement {
    state: Arc<DriverState>,
    sql: String,
    closed: bool,
}

impl MemoryStatement {
    fn check(&self) -> Result<()> {
        if self.closed {
            Err(PoolError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl DriverStatement for MemoryStatement {
    fn execute(&mut self, params: &[Value]) -> Result<u64> {
        self.check()?;
        self.state.executes.fetch_add(1, Ordering::SeqCst);
        Ok(params.len() as u64)
    }

    fn query(&mut self, params: &[Value]) -> Result<Vec<Row>> {
        self.check()?;
        // Echo the parameters back so repeated runs are comparable
        let mut row: Row = vec![Value::Text(self.sql.clone())];
        row.extend_from_slice(params);
        Ok(vec![row])
    }

    fn clear_parameters(&mut self) -> Result<()> {
        self.check()
    }

    fn set_fetch_size(&mut self, _rows: u32) -> Result<()> {
        self.check()?;
        self.state.property_sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_max_rows(&mut self, _rows: u64) -> Result<()> {
        self.check()?;
        self.state.property_sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_query_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        self.check()?;
        self.state.property_sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct MemoryResource {
    id: u64,
}

impl TwoPhaseResource for MemoryResource {
    fn resource_id(&self) -> u64 {
        self.id
    }

    fn prepare(&self, _tx: &TxId) -> Result<Vote> {
        Ok(Vote::Commit)
    }

    fn commit(&self, _tx: &TxId, _one_phase: bool) -> Result<()> {
        Ok(())
    }

    fn rollback(&self, _tx: &TxId) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    RollbackOnly,
    Committed,
    RolledBack,
}

struct TxRecord {
    status: TxStatus,
    resources: Vec<Arc<dyn TwoPhaseResource>>,
    callbacks: Vec<CompletionCallback>,
    enlist_count: usize,
}

#[derive(Default)]
struct CoordInner {
    txs: HashMap<TxId, TxRecord>,
}

/// Minimal transaction coordinator for tests
#[derive(Default)]
pub struct MemoryCoordinator {
    inner: Mutex<CoordInner>,
    fail_enlist: AtomicBool,
    fail_register: AtomicBool,
    enlist_held: Mutex<bool>,
    enlist_released: Condvar,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        MemoryCoordinator::default()
    }

    /// Start a transaction and return its id.
    pub fn begin(&self) -> TxId {
        let tx = TxId::new();
        self.inner.lock().txs.insert(
            tx,
            TxRecord {
                status: TxStatus::Active,
                resources: Vec::new(),
                callbacks: Vec::new(),
                enlist_count: 0,
            },
        );
        tx
    }

    /// Doom the transaction; later enlists see `RollbackOnly`.
    pub fn set_rollback_only(&self, tx: TxId) {
        if let Some(record) = self.inner.lock().txs.get_mut(&tx) {
            if record.status == TxStatus::Active {
                record.status = TxStatus::RollbackOnly;
            }
        }
    }

    /// Make every future enlist fail
    pub fn set_fail_enlist(&self, fail: bool) {
        self.fail_enlist.store(fail, Ordering::SeqCst);
    }

    /// Make every future `register_completion` fail
    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    /// Block every enlist call until [`MemoryCoordinator::release_enlist`]
    pub fn hold_enlist(&self) {
        *self.enlist_held.lock() = true;
    }

    /// Let blocked and future enlist calls proceed
    pub fn release_enlist(&self) {
        *self.enlist_held.lock() = false;
        self.enlist_released.notify_all();
    }

    /// How many times resources were enlisted for `tx`
    pub fn enlisted_count(&self, tx: TxId) -> usize {
        self.inner
            .lock()
            .txs
            .get(&tx)
            .map_or(0, |record| record.enlist_count)
    }

    /// Finish the transaction: drive two-phase completion over the
    /// enlisted resources, then fire the callbacks with no lock held.
    pub fn complete(&self, tx: TxId, commit: bool) {
        let (resources, callbacks, rollback_only) = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.txs.get_mut(&tx) else {
                return;
            };
            if matches!(record.status, TxStatus::Committed | TxStatus::RolledBack) {
                return;
            }
            let rollback_only = record.status == TxStatus::RollbackOnly;
            record.status = if commit && !rollback_only {
                TxStatus::Committed
            } else {
                TxStatus::RolledBack
            };
            (
                std::mem::take(&mut record.resources),
                std::mem::take(&mut record.callbacks),
                rollback_only,
            )
        };

        if commit && !rollback_only {
            if let [only] = resources.as_slice() {
                if let Err(e) = only.commit(&tx, true) {
                    warn!(%tx, error = %e, "one-phase commit failed");
                }
            } else {
                let mut voters = Vec::new();
                for resource in &resources {
                    match resource.prepare(&tx) {
                        Ok(Vote::Commit) => voters.push(Arc::clone(resource)),
                        Ok(Vote::ReadOnly) => {}
                        Err(e) => warn!(%tx, error = %e, "prepare failed"),
                    }
                }
                for resource in voters {
                    if let Err(e) = resource.commit(&tx, false) {
                        warn!(%tx, error = %e, "commit failed");
                    }
                }
            }
        } else {
            for resource in &resources {
                if let Err(e) = resource.rollback(&tx) {
                    warn!(%tx, error = %e, "rollback failed");
                }
            }
        }

        for callback in callbacks {
            callback(tx);
        }
    }
}

impl TransactionCoordinator for MemoryCoordinator {
    fn enlist(&self, tx: TxId, resource: Arc<dyn TwoPhaseResource>) -> Result<EnlistOutcome> {
        {
            let mut held = self.enlist_held.lock();
            while *held {
                self.enlist_released.wait(&mut held);
            }
        }
        if self.fail_enlist.load(Ordering::SeqCst) {
            return Err(PoolError::Enlistment(
                "coordinator refused enlistment".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        let Some(record) = inner.txs.get_mut(&tx) else {
            return Ok(EnlistOutcome::AlreadyCompleted);
        };
        match record.status {
            TxStatus::Committed | TxStatus::RolledBack => Ok(EnlistOutcome::AlreadyCompleted),
            status => {
                record.resources.push(resource);
                record.enlist_count += 1;
                if status == TxStatus::RollbackOnly {
                    Ok(EnlistOutcome::RollbackOnly)
                } else {
                    Ok(EnlistOutcome::Enlisted)
                }
            }
        }
    }

    fn register_completion(&self, tx: TxId, callback: CompletionCallback) -> Result<()> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(PoolError::Enlistment(
                "completion registration refused".to_string(),
            ));
        }
        {
            let mut inner = self.inner.lock();
            if let Some(record) = inner.txs.get_mut(&tx) {
                if matches!(record.status, TxStatus::Active | TxStatus::RollbackOnly) {
                    record.callbacks.push(callback);
                    return Ok(());
                }
            }
        }
        // Already finished: the contract says fire it right here, with
        // the coordinator lock released.
        callback(tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_counts_and_failure_switches() {
        let driver = MemoryDriver::new();
        let creds = Credentials::new("app", "pw");

        let mut conn = driver.connect("mem://x", &creds).unwrap();
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(driver.open_count(), 1);

        conn.ping().unwrap();
        driver.fail_next_pings(1);
        assert!(conn.ping().is_err());
        conn.ping().unwrap();

        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(driver.open_count(), 0);

        driver.set_fail_connects(true);
        assert!(driver.connect("mem://x", &creds).is_err());
        assert_eq!(driver.connect_count(), 1);
    }

    #[test]
    fn test_statement_echo_query() {
        let driver = MemoryDriver::new();
        let mut conn = driver
            .connect("mem://x", &Credentials::new("app", "pw"))
            .unwrap();
        let mut stmt = conn.prepare("SELECT ?").unwrap();
        let rows = stmt.query(&[Value::Int(42)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], Value::Int(42));
    }

    #[test]
    fn test_coordinator_enlist_then_complete_fires_callback() {
        let coordinator = MemoryCoordinator::new();
        let driver = MemoryDriver::new();
        let conn = driver
            .connect("mem://x", &Credentials::new("app", "pw"))
            .unwrap();
        let tx = coordinator.begin();

        assert_eq!(
            coordinator.enlist(tx, conn.two_phase()).unwrap(),
            EnlistOutcome::Enlisted
        );
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        coordinator
            .register_completion(
                tx,
                Box::new(move |_| flag.store(true, Ordering::SeqCst)),
            )
            .unwrap();
        assert!(!fired.load(Ordering::SeqCst));

        coordinator.complete(tx, true);
        assert!(fired.load(Ordering::SeqCst));
        // Completing twice is a no-op
        coordinator.complete(tx, true);
    }

    #[test]
    fn test_coordinator_unknown_tx_is_already_completed() {
        let coordinator = MemoryCoordinator::new();
        let driver = MemoryDriver::new();
        let conn = driver
            .connect("mem://x", &Credentials::new("app", "pw"))
            .unwrap();
        assert_eq!(
            coordinator.enlist(TxId::new(), conn.two_phase()).unwrap(),
            EnlistOutcome::AlreadyCompleted
        );
    }

    #[test]
    fn test_coordinator_late_registration_fires_immediately() {
        let coordinator = MemoryCoordinator::new();
        let tx = coordinator.begin();
        coordinator.complete(tx, false);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        coordinator
            .register_completion(
                tx,
                Box::new(move |_| flag.store(true, Ordering::SeqCst)),
            )
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_enlist_gate_blocks_until_released() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let driver = MemoryDriver::new();
        let conn = driver
            .connect("mem://x", &Credentials::new("app", "pw"))
            .unwrap();
        let tx = coordinator.begin();
        coordinator.hold_enlist();

        let resource = conn.two_phase();
        let worker = {
            let coordinator = Arc::clone(&coordinator);
            std::thread::spawn(move || coordinator.enlist(tx, resource))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());

        coordinator.release_enlist();
        assert_eq!(worker.join().unwrap().unwrap(), EnlistOutcome::Enlisted);
        assert_eq!(coordinator.enlisted_count(tx), 1);
    }

    #[test]
    fn test_rollback_only_dooms_commit() {
        let coordinator = MemoryCoordinator::new();
        let driver = MemoryDriver::new();
        let conn = driver
            .connect("mem://x", &Credentials::new("app", "pw"))
            .unwrap();
        let tx = coordinator.begin();
        coordinator.set_rollback_only(tx);
        assert_eq!(
            coordinator.enlist(tx, conn.two_phase()).unwrap(),
            EnlistOutcome::RollbackOnly
        );
        // Commit request still ends in rollback
        coordinator.complete(tx, true);
        assert_eq!(
            coordinator.enlist(tx, conn.two_phase()).unwrap(),
            EnlistOutcome::AlreadyCompleted
        );
    }
}
