//! Error types for the connection manager
//!
//! One enum covers the whole taxonomy. We use `thiserror` for automatic
//! `Display` and `Error` trait implementations.

use thiserror::Error;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Error taxonomy for the connection manager
///
/// `PoolExhausted`, `AcquireTimeout`, `BackendUnavailable` and
/// `Enlistment` map one-to-one onto the rejection counters kept by the
/// pool; `ConnectionClosed` is what every operation on a destroyed
/// connection returns.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool is at capacity and waiting is disabled or the waiter
    /// limit has been reached. Rejected immediately.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The caller waited for a free connection and the wait timed out.
    #[error("timed out after {waited_ms} ms waiting for a pooled connection")]
    AcquireTimeout {
        /// Total time spent inside acquire before giving up
        waited_ms: u64,
    },

    /// Opening a physical connection or probing its health failed.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The transaction coordinator rejected enlistment for a reason
    /// other than rollback-only or already-completed.
    #[error("transaction enlistment failed: {0}")]
    Enlistment(String),

    /// Operation attempted on a destroyed connection or closed handle.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The pool has been shut down.
    #[error("pool is shut down")]
    PoolClosed,

    /// Invalid or unparseable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Error reported by the backing driver.
    #[error("driver error: {0}")]
    Driver(String),
}

impl PoolError {
    /// True for the rejection variants a caller can retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted | PoolError::AcquireTimeout { .. }
        )
    }
}
