//! Transactional pooled-connection manager
//!
//! A bounded set of physical database connections multiplexed across
//! many short-lived logical handles. Acquire blocks fairly when the
//! pool is full, transactions stick to one physical connection, broken
//! and leaked connections are reclaimed, and each connection keeps a
//! small prepared-statement cache so hot statements skip recompilation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidepool_core::{Credentials, Driver, PoolConfig, TransactionCoordinator};
//! use tidepool_pool::ConnectionPool;
//!
//! fn run(driver: Arc<dyn Driver>, coordinator: Arc<dyn TransactionCoordinator>)
//!     -> tidepool_core::Result<()>
//! {
//!     let pool = ConnectionPool::new(
//!         "orders",
//!         "db://orders-primary",
//!         Credentials::new("app", "secret"),
//!         driver,
//!         coordinator,
//!         PoolConfig::default(),
//!     )?;
//!     let conn = pool.acquire(None)?;
//!     let stmt = conn.prepare("SELECT id FROM orders WHERE state = ?")?;
//!     let rows = stmt.query(&["open".into()])?;
//!     drop(rows);
//!     Ok(())
//! }
//! ```

mod cache;
mod handle;
mod maintenance;
mod managed;
mod pool;
mod registry;
mod stats;
pub mod testing;

pub use handle::{LogicalHandle, StatementHandle};
pub use maintenance::Maintenance;
pub use managed::{ConnStatus, DestroyReason, ManagedConnection};
pub use pool::ConnectionPool;
pub use registry::PoolRegistry;
pub use stats::PoolStats;
