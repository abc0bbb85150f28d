//! Tidepool - transactional pooled-connection manager
//!
//! Tidepool multiplexes a bounded set of physical database connections
//! across many short-lived logical handles, with transaction affinity,
//! a fair bounded waiting protocol, leak and age reclamation, and a
//! per-connection prepared-statement cache.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidepool::{ConnectionPool, Credentials, PoolConfig};
//!
//! let pool = ConnectionPool::new(
//!     "orders",
//!     "db://orders-primary",
//!     Credentials::new("app", "secret"),
//!     driver,
//!     coordinator,
//!     PoolConfig::default(),
//! )?;
//!
//! let conn = pool.acquire(None)?;
//! let stmt = conn.prepare("SELECT id FROM orders WHERE state = ?")?;
//! let rows = stmt.query(&["open".into()])?;
//! ```
//!
//! # Architecture
//!
//! The backing database and the transaction coordinator sit behind the
//! [`Driver`] and [`TransactionCoordinator`] traits; the pool never
//! talks to a concrete backend. [`ConnectionPool`] owns the bounded
//! connection set, [`PoolRegistry`] names pools process-wide, and
//! [`Maintenance`] runs the periodic reclamation and sampling work.

pub use tidepool_core::*;
pub use tidepool_pool::*;
