//! Core types for the tidepool connection manager
//!
//! This crate holds everything the pool and its collaborators agree on:
//! - Error taxonomy and `Result` alias
//! - Identifiers and credentials
//! - SQL parameter values and result rows
//! - Pool configuration (loadable from `tidepool.toml`)
//! - Collaborator traits: driver, two-phase-commit resource, and
//!   transaction coordinator

pub mod config;
pub mod error;
pub mod traits;
pub mod types;
pub mod value;

pub use config::{CheckLevel, PoolConfig, CONFIG_FILE_NAME};
pub use error::{PoolError, Result};
pub use traits::{
    CompletionCallback, Driver, DriverConnection, DriverStatement, EnlistOutcome,
    TransactionCoordinator, TwoPhaseResource, Vote,
};
pub use types::{Credentials, TxId};
pub use value::{Row, Value};
