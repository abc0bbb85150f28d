//! Named pool registry
//!
//! Processes usually run one pool per data source and look them up by
//! name. The registry is a concurrent map; lookups take no global lock.

use dashmap::DashMap;
use tidepool_core::{PoolError, Result};
use tracing::info;

use crate::pool::ConnectionPool;

/// Process-wide map of named pools
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, ConnectionPool>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        PoolRegistry {
            pools: DashMap::new(),
        }
    }

    /// Register a pool under its own name.
    ///
    /// # Errors
    ///
    /// Fails if a pool with the same name is already registered.
    pub fn register(&self, pool: ConnectionPool) -> Result<()> {
        let name = pool.name().to_string();
        match self.pools.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PoolError::Config(format!(
                "pool '{name}' is already registered"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(pool);
                info!(pool = %name, "pool registered");
                Ok(())
            }
        }
    }

    /// Remove and return a pool. The caller decides whether to shut it
    /// down; outstanding handles keep working either way.
    pub fn unregister(&self, name: &str) -> Option<ConnectionPool> {
        let removed = self.pools.remove(name).map(|(_, pool)| pool);
        if removed.is_some() {
            info!(pool = %name, "pool unregistered");
        }
        removed
    }

    /// Look a pool up by name.
    pub fn get(&self, name: &str) -> Option<ConnectionPool> {
        self.pools.get(name).map(|entry| entry.clone())
    }

    /// Names of every registered pool, unordered.
    pub fn names(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
