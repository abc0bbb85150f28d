//! Logical handles
//!
//! A `LogicalHandle` is what callers hold: a thin wrapper over one
//! managed physical connection plus a weak back-reference to the pool.
//! Closing the handle (explicitly or on drop) returns the hold to the
//! pool; whether the connection becomes free depends on the remaining
//! holds and any bound transaction. The back-reference is weak so a
//! handle that outlives its pool degrades to errors rather than keeping
//! the pool alive.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tidepool_core::{PoolError, Result, Row, TxId, Value};
use tracing::debug;

use crate::cache::CachedStatement;
use crate::managed::ManagedConnection;
use crate::pool::PoolShared;

/// Caller-facing connection handle
pub struct LogicalHandle {
    conn: Arc<ManagedConnection>,
    pool: Weak<PoolShared>,
    closed: AtomicBool,
}

impl LogicalHandle {
    pub(crate) fn new(conn: Arc<ManagedConnection>, pool: Weak<PoolShared>) -> Self {
        LogicalHandle {
            conn,
            pool,
            closed: AtomicBool::new(false),
        }
    }

    /// Identity of the backing physical connection
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Transaction this handle's connection is bound to, if any
    pub fn transaction(&self) -> Option<TxId> {
        self.conn.bound_tx()
    }

    /// Compile or fetch a cached prepared statement.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` on a closed handle or a connection
    /// the pool has reclaimed, or with the driver's compile error.
    pub fn prepare(&self, sql: &str) -> Result<StatementHandle> {
        self.check()?;
        let stmt = self.conn.prepare(sql)?;
        Ok(StatementHandle {
            stmt,
            closed: AtomicBool::new(false),
        })
    }

    /// Return the hold to the pool. Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.pool.upgrade() {
            Some(pool) => pool.release(&self.conn),
            None => debug!(id = self.conn.id(), "handle closed after pool was dropped"),
        }
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Drop for LogicalHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LogicalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalHandle")
            .field("connection_id", &self.conn.id())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Caller-facing prepared statement backed by a cache entry.
///
/// Closing releases the entry back to the connection's cache; the
/// compiled driver statement stays open for reuse.
pub struct StatementHandle {
    stmt: Arc<Mutex<CachedStatement>>,
    closed: AtomicBool,
}

impl StatementHandle {
    /// SQL text this statement was compiled from
    pub fn sql(&self) -> String {
        self.stmt.lock().sql().to_string()
    }

    /// Run a statement that returns no rows; yields the affected count.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` on a closed handle, or with the
    /// driver's execution error.
    pub fn execute(&self, params: &[Value]) -> Result<u64> {
        self.check()?;
        self.stmt.lock().execute(params)
    }

    /// Run a query and collect its rows.
    ///
    /// # Errors
    ///
    /// Same conditions as [`StatementHandle::execute`].
    pub fn query(&self, params: &[Value]) -> Result<Vec<Row>> {
        self.check()?;
        self.stmt.lock().query(params)
    }

    /// Rows fetched per round trip. Sets the property-dirty flag so the
    /// next cache reuse restores defaults.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` on a closed handle.
    pub fn set_fetch_size(&self, rows: u32) -> Result<()> {
        self.check()?;
        self.stmt.lock().set_fetch_size(rows)
    }

    /// Cap on rows returned by a query. Dirties the statement.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` on a closed handle.
    pub fn set_max_rows(&self, rows: u64) -> Result<()> {
        self.check()?;
        self.stmt.lock().set_max_rows(rows)
    }

    /// Per-execution timeout. Dirties the statement.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` on a closed handle.
    pub fn set_query_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.check()?;
        self.stmt.lock().set_query_timeout(timeout)
    }

    /// Release the cache entry for reuse. Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stmt.lock().release();
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementHandle")
            .field("sql", &self.sql())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
