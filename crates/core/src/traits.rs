//! Collaborator traits at the pool's boundary
//!
//! The pool treats the backing database and the transaction coordinator
//! as opaque collaborators behind these traits. Handles forward to them
//! through plain trait dispatch; there is no reflective routing anywhere.
//!
//! Thread safety: `Driver`, `TwoPhaseResource` and
//! `TransactionCoordinator` are shared across threads (`Send + Sync`);
//! a `DriverConnection` is owned by one managed connection at a time and
//! only needs `Send`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Credentials, TxId};
use crate::value::{Row, Value};

/// Factory for physical database connections
pub trait Driver: Send + Sync {
    /// Open a new physical connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses or cannot be reached.
    fn connect(&self, url: &str, credentials: &Credentials) -> Result<Box<dyn DriverConnection>>;
}

/// One open session to the backing database
pub trait DriverConnection: Send {
    /// Compile a statement for later execution.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails or the session is gone.
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn DriverStatement>>;

    /// Switch auto-commit mode on or off.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is gone.
    fn set_auto_commit(&mut self, enabled: bool) -> Result<()>;

    /// True once the session has been closed, by either side.
    fn is_closed(&self) -> bool;

    /// Cheap liveness round-trip.
    ///
    /// # Errors
    ///
    /// Returns an error if the session no longer answers.
    fn ping(&mut self) -> Result<()>;

    /// Physically close the session. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the close itself fails; the session is
    /// considered closed regardless.
    fn close(&mut self) -> Result<()>;

    /// The two-phase-commit resource facade over this session.
    fn two_phase(&self) -> Arc<dyn TwoPhaseResource>;
}

/// A compiled statement bound to one driver connection
pub trait DriverStatement: Send {
    /// Execute a data-modifying statement; returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns an error if execution fails.
    fn execute(&mut self, params: &[Value]) -> Result<u64>;

    /// Execute a query; returns the result rows.
    ///
    /// # Errors
    ///
    /// Returns an error if execution fails.
    fn query(&mut self, params: &[Value]) -> Result<Vec<Row>>;

    /// Drop all currently bound parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement is gone.
    fn clear_parameters(&mut self) -> Result<()>;

    /// Set the fetch size hint. 0 restores the driver default.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement is gone.
    fn set_fetch_size(&mut self, rows: u32) -> Result<()>;

    /// Cap the number of returned rows. 0 removes the cap.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement is gone.
    fn set_max_rows(&mut self, rows: u64) -> Result<()>;

    /// Set or clear the per-execution timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement is gone.
    fn set_query_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Release the backend cursor. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the close itself fails.
    fn close(&mut self) -> Result<()>;
}

/// Vote returned by the prepare phase of two-phase commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Resource has work to commit
    Commit,
    /// Resource performed no writes and drops out of phase two
    ReadOnly,
}

/// Two-phase-commit resource facade over one physical connection
///
/// The pool only enlists this with a coordinator; it never drives the
/// protocol itself.
pub trait TwoPhaseResource: Send + Sync {
    /// Stable identity of the owning resource manager.
    fn resource_id(&self) -> u64;

    /// Phase one: prepare the transaction branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the branch cannot be prepared.
    fn prepare(&self, tx: &TxId) -> Result<Vote>;

    /// Phase two: commit the branch. `one_phase` skips the prepare
    /// handshake for single-resource transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    fn commit(&self, tx: &TxId, one_phase: bool) -> Result<()>;

    /// Roll the branch back.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails.
    fn rollback(&self, tx: &TxId) -> Result<()>;

    /// Whether two facades talk to the same resource manager.
    fn is_same_rm(&self, other: &dyn TwoPhaseResource) -> bool {
        self.resource_id() == other.resource_id()
    }
}

/// Outcome of enlisting a resource with the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistOutcome {
    /// Resource is enlisted; work runs under the transaction.
    Enlisted,
    /// Transaction is already marked rollback-only. The resource is
    /// enlisted anyway; its work will simply roll back.
    RollbackOnly,
    /// Transaction already completed; the connection falls back to
    /// auto-commit.
    AlreadyCompleted,
}

/// Callback invoked exactly once when a transaction finishes
pub type CompletionCallback = Box<dyn FnOnce(TxId) + Send>;

/// External transaction coordinator
///
/// Must not hold internal locks while invoking completion callbacks:
/// callbacks re-enter the pool.
pub trait TransactionCoordinator: Send + Sync {
    /// Enlist a two-phase resource with the given transaction.
    ///
    /// # Errors
    ///
    /// Returns an error for any failure other than the rollback-only
    /// and already-completed cases, which are ordinary outcomes.
    fn enlist(&self, tx: TxId, resource: Arc<dyn TwoPhaseResource>) -> Result<EnlistOutcome>;

    /// Register a completion callback for the transaction.
    ///
    /// If the transaction has already completed, the callback is invoked
    /// immediately on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator cannot accept the registration.
    fn register_completion(&self, tx: TxId, callback: CompletionCallback) -> Result<()>;
}
