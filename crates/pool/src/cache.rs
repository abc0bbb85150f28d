//! Per-connection prepared-statement cache
//!
//! Keyed by exact SQL text. A cache hit skips recompilation, clears the
//! previously bound parameters, and resets statement properties (fetch
//! size, row cap, timeout) only when a caller actually changed them
//! since the last reset: the dirty flag makes reuse of an untouched
//! statement a no-op beyond parameter clearing.
//!
//! The cache is bounded by `pstmt_max`. When full, eviction removes the
//! first entry whose caller is done with it; if every cached statement
//! is currently in use, the cache temporarily exceeds its bound rather
//! than evicting a statement out from under a live handle.

use parking_lot::Mutex;
use std::sync::Arc;
use tidepool_core::{DriverConnection, DriverStatement, PoolError, Result, Row, Value};
use tracing::warn;

/// A compiled statement plus the reuse bookkeeping the cache needs
pub struct CachedStatement {
    sql: String,
    stmt: Box<dyn DriverStatement>,
    /// True while a caller holds a handle over this wrapper
    in_use: bool,
    /// Set when a caller changed fetch size, row cap or timeout
    props_dirty: bool,
}

impl CachedStatement {
    fn new(sql: String, stmt: Box<dyn DriverStatement>) -> Self {
        CachedStatement {
            sql,
            stmt,
            in_use: true,
            props_dirty: false,
        }
    }

    /// The SQL text this statement was compiled from
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub(crate) fn execute(&mut self, params: &[Value]) -> Result<u64> {
        self.check_open()?;
        self.stmt.execute(params)
    }

    pub(crate) fn query(&mut self, params: &[Value]) -> Result<Vec<Row>> {
        self.check_open()?;
        self.stmt.query(params)
    }

    pub(crate) fn set_fetch_size(&mut self, rows: u32) -> Result<()> {
        self.check_open()?;
        self.props_dirty = true;
        self.stmt.set_fetch_size(rows)
    }

    pub(crate) fn set_max_rows(&mut self, rows: u64) -> Result<()> {
        self.check_open()?;
        self.props_dirty = true;
        self.stmt.set_max_rows(rows)
    }

    pub(crate) fn set_query_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.check_open()?;
        self.props_dirty = true;
        self.stmt.set_query_timeout(timeout)
    }

    /// Caller is done with this wrapper; the compiled statement stays
    /// cached for the next `get` of the same SQL.
    pub(crate) fn release(&mut self) {
        self.in_use = false;
    }

    fn check_open(&self) -> Result<()> {
        if self.in_use {
            Ok(())
        } else {
            Err(PoolError::ConnectionClosed)
        }
    }

    /// Prepare the wrapper for hand-out on a cache hit.
    fn reuse(&mut self) -> Result<()> {
        self.stmt.clear_parameters()?;
        if self.props_dirty {
            self.stmt.set_fetch_size(0)?;
            self.stmt.set_max_rows(0)?;
            self.stmt.set_query_timeout(None)?;
            self.props_dirty = false;
        }
        self.in_use = true;
        Ok(())
    }
}

/// Bounded statement cache owned by one physical connection
pub struct StatementCache {
    capacity: usize,
    entries: Vec<Arc<Mutex<CachedStatement>>>,
}

impl StatementCache {
    /// Create a cache bounded at `capacity` statements.
    pub fn new(capacity: usize) -> Self {
        StatementCache {
            capacity,
            entries: Vec::new(),
        }
    }

    /// Number of cached statements (in use or not).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up or compile a statement for `sql`.
    ///
    /// Returns the wrapper and whether this was a cache hit.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation or the hit-path reset fails.
    pub fn get(
        &mut self,
        sql: &str,
        conn: &mut dyn DriverConnection,
    ) -> Result<(Arc<Mutex<CachedStatement>>, bool)> {
        for entry in &self.entries {
            let mut cached = entry.lock();
            // An in-use entry is never shared; fall through and compile
            // a second statement for the same text instead.
            if cached.sql == sql && !cached.in_use {
                cached.reuse()?;
                drop(cached);
                return Ok((Arc::clone(entry), true));
            }
        }

        if self.entries.len() >= self.capacity {
            self.evict_one_closed();
        }

        let stmt = conn.prepare(sql)?;
        let entry = Arc::new(Mutex::new(CachedStatement::new(sql.to_string(), stmt)));
        self.entries.push(Arc::clone(&entry));
        Ok((entry, false))
    }

    /// Remove the first entry no caller is using. If every entry is in
    /// use, nothing is evicted and the cache runs over its bound.
    fn evict_one_closed(&mut self) {
        if let Some(pos) = self.entries.iter().position(|e| !e.lock().in_use) {
            let entry = self.entries.remove(pos);
            let mut cached = entry.lock();
            if let Err(e) = cached.stmt.close() {
                warn!(sql = %cached.sql, error = %e, "failed to close evicted statement");
            }
        }
    }

    /// Force-close every cached statement. Called when the owning
    /// connection is destroyed so no backend cursors leak.
    ///
    /// Statements still held by a caller at this point are closed
    /// anyway; the mismatch is logged, never thrown.
    pub fn shutdown(&mut self) {
        let mut still_open = 0usize;
        for entry in self.entries.drain(..) {
            let mut cached = entry.lock();
            if cached.in_use {
                still_open += 1;
                cached.in_use = false;
            }
            if let Err(e) = cached.stmt.close() {
                warn!(sql = %cached.sql, error = %e, "failed to close statement during sweep");
            }
        }
        if still_open > 0 {
            warn!(
                count = still_open,
                "force-closed statements that were still open at connection destroy"
            );
        }
    }
}
