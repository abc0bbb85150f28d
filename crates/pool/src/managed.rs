//! Managed physical connection
//!
//! Owns one driver session, its two-phase-commit resource facade and its
//! statement cache, and tracks the lifecycle the pool reasons about:
//!
//! ```text
//! CREATED → FREE ⇄ HELD → DESTROYED
//!                  └ may carry a bound transaction while held
//! ```
//!
//! `DESTROYED` is terminal; any operation routed through a destroyed
//! connection fails with `ConnectionClosed`. Destruction happens on
//! aging, leak reclamation, health-probe failure, pool shrink, or pool
//! shutdown; the reason is kept for logging.
//!
//! Lock order: pool lock → connection state → driver side. Never the
//! reverse.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidepool_core::{DriverConnection, PoolError, Result, TwoPhaseResource, TxId};
use tracing::{debug, warn};

use crate::cache::{CachedStatement, StatementCache};

/// Coarse lifecycle state of a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// In the pool's free set
    Free,
    /// Handed out to at least one logical handle
    Held,
    /// Terminal
    Destroyed,
}

/// Why a connection was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Exceeded `max_age` while free
    Aged,
    /// Held past `max_open_time` with no bound transaction
    Leaked,
    /// Failed an acquisition-time health probe
    ProbeFailed,
    /// Pool shrank below current size after a config change
    Shrunk,
    /// Driver reported an unrecoverable error mid-acquire
    Errored,
    /// Pool shut down
    Shutdown,
}

struct ConnState {
    status: ConnStatus,
    hold_count: u32,
    bound_tx: Option<TxId>,
    last_held_at: Instant,
}

struct DriverSide {
    conn: Box<dyn DriverConnection>,
    statements: StatementCache,
}

/// Result of decrementing the hold count
pub(crate) struct HoldRelease {
    /// The count was already zero (double release)
    pub underflow: bool,
    /// Remaining holds after the decrement
    pub hold_count: u32,
    /// Transaction still bound, if any
    pub bound_tx: Option<TxId>,
}

/// One pooled physical connection
pub struct ManagedConnection {
    id: u64,
    created_at: Instant,
    /// Statement-cache hits; the pool's reuse-priority key
    reuse_hits: AtomicU64,
    resource: Arc<dyn TwoPhaseResource>,
    driver: Mutex<DriverSide>,
    state: Mutex<ConnState>,
}

impl ManagedConnection {
    pub(crate) fn new(id: u64, conn: Box<dyn DriverConnection>, pstmt_max: usize) -> Self {
        let resource = conn.two_phase();
        ManagedConnection {
            id,
            created_at: Instant::now(),
            reuse_hits: AtomicU64::new(0),
            resource,
            driver: Mutex::new(DriverSide {
                conn,
                statements: StatementCache::new(pstmt_max),
            }),
            state: Mutex::new(ConnState {
                status: ConnStatus::Free,
                hold_count: 0,
                bound_tx: None,
                last_held_at: Instant::now(),
            }),
        }
    }

    /// Monotonic identity within the owning pool
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the physical connection was opened
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Statement-cache hit count
    pub fn reuse_hits(&self) -> u64 {
        self.reuse_hits.load(Ordering::Relaxed)
    }

    /// The two-phase-commit resource facade for enlistment
    pub fn two_phase(&self) -> Arc<dyn TwoPhaseResource> {
        Arc::clone(&self.resource)
    }

    /// Compile or fetch a cached statement for `sql`.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` on a destroyed connection, or with
    /// the driver's error if compilation fails.
    pub(crate) fn prepare(&self, sql: &str) -> Result<Arc<Mutex<CachedStatement>>> {
        self.check_live()?;
        let mut driver = self.driver.lock();
        let DriverSide { conn, statements } = &mut *driver;
        let (stmt, hit) = statements.get(sql, conn.as_mut())?;
        if hit {
            self.reuse_hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(stmt)
    }

    pub(crate) fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.check_live()?;
        self.driver.lock().conn.set_auto_commit(enabled)
    }

    /// Acquisition-time health probe: closed check, ping, and (when
    /// given) a round-trip of the configured test statement.
    ///
    /// # Errors
    ///
    /// Any failure means the connection must be destroyed, not reused.
    pub(crate) fn probe(&self, test_statement: Option<&str>) -> Result<()> {
        let mut driver = self.driver.lock();
        if driver.conn.is_closed() {
            return Err(PoolError::BackendUnavailable(
                "connection reports closed".to_string(),
            ));
        }
        driver.conn.ping()?;
        if let Some(sql) = test_statement {
            // Bypasses the statement cache so probes never count as reuse
            let mut stmt = driver.conn.prepare(sql)?;
            stmt.query(&[])?;
            stmt.close()?;
        }
        Ok(())
    }

    pub(crate) fn mark_held(&self) {
        let mut state = self.state.lock();
        state.status = ConnStatus::Held;
        state.hold_count += 1;
        state.last_held_at = Instant::now();
    }

    pub(crate) fn release_hold(&self) -> HoldRelease {
        let mut state = self.state.lock();
        if state.hold_count == 0 {
            return HoldRelease {
                underflow: true,
                hold_count: 0,
                bound_tx: state.bound_tx,
            };
        }
        state.hold_count -= 1;
        HoldRelease {
            underflow: false,
            hold_count: state.hold_count,
            bound_tx: state.bound_tx,
        }
    }

    pub(crate) fn bind_tx(&self, tx: TxId) {
        self.state.lock().bound_tx = Some(tx);
    }

    /// Drop the transaction binding; returns the remaining hold count so
    /// the caller can decide whether the connection is free now.
    pub(crate) fn clear_tx(&self) -> u32 {
        let mut state = self.state.lock();
        state.bound_tx = None;
        state.hold_count
    }

    /// Transaction currently bound, if any
    pub fn bound_tx(&self) -> Option<TxId> {
        self.state.lock().bound_tx
    }

    /// Current number of logical holds
    pub fn hold_count(&self) -> u32 {
        self.state.lock().hold_count
    }

    pub(crate) fn mark_free(&self) {
        let mut state = self.state.lock();
        if state.status != ConnStatus::Destroyed {
            state.status = ConnStatus::Free;
        }
    }

    /// True once the connection has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().status == ConnStatus::Destroyed
    }

    /// Past its maximum age (eligible for eviction while free)
    pub(crate) fn is_aged(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    /// Held past the open-time limit with no bound transaction: the
    /// caller forgot to release it.
    pub(crate) fn is_leaked(&self, max_open_time: Duration) -> bool {
        let state = self.state.lock();
        state.status == ConnStatus::Held
            && state.hold_count > 0
            && state.bound_tx.is_none()
            && state.last_held_at.elapsed() > max_open_time
    }

    /// Destroy the physical connection: sweep the statement cache and
    /// close the driver session. Idempotent.
    pub(crate) fn destroy(&self, reason: DestroyReason) {
        {
            let mut state = self.state.lock();
            if state.status == ConnStatus::Destroyed {
                return;
            }
            state.status = ConnStatus::Destroyed;
        }
        let mut driver = self.driver.lock();
        driver.statements.shutdown();
        if let Err(e) = driver.conn.close() {
            warn!(id = self.id, error = %e, "error closing physical connection");
        }
        debug!(id = self.id, reason = ?reason, "destroyed physical connection");
    }

    fn check_live(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(PoolError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("hold_count", &state.hold_count)
            .field("bound_tx", &state.bound_tx)
            .field("reuse_hits", &self.reuse_hits())
            .finish()
    }
}
