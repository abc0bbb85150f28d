//! Identifiers and credentials
//!
//! `TxId` is the opaque reference to a distributed transaction. The pool
//! never looks inside it; it only uses it as a map key to guarantee
//! transaction affinity. Callers obtain one from their transaction
//! coordinator and pass it explicitly; the pool never infers "is there
//! a transaction?" from a failed lookup.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque distributed-transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(Uuid);

impl TxId {
    /// Generate a fresh transaction id
    pub fn new() -> Self {
        TxId(Uuid::new_v4())
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Credentials handed to the driver when opening a physical connection
///
/// The password is redacted from `Debug` output so credentials can be
/// carried in tracing fields without leaking secrets.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Database user name
    pub user: String,
    /// Password for that user
    pub password: String,
}

impl Credentials {
    /// Create a credential set
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}
