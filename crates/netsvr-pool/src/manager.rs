use crate::pool::TaskSocketPool;
use crate::task_socket::TaskSocket;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use netsvr_core::addr::worker_addr_to_hex;
use netsvr_core::error::RegistryError;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of connection pools keyed by encoded worker address
#[derive(Default)]
pub struct TaskSocketPoolManager {
    pools: DashMap<String, Arc<TaskSocketPool>>,
}

impl TaskSocketPoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool, returning its registry key. Duplicate keys are rejected.
    pub fn add_socket(&self, pool: impl Into<Arc<TaskSocketPool>>) -> Result<String, RegistryError> {
        let pool = pool.into();
        let key = worker_addr_to_hex(pool.worker_addr())?;
        match self.pools.entry(key.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateWorker {
                worker_addr: pool.worker_addr().to_string(),
            }),
            Entry::Vacant(slot) => {
                debug!(worker_addr = %pool.worker_addr(), key = %key, "Task socket pool added");
                slot.insert(pool);
                Ok(key)
            }
        }
    }

    pub fn get_pool(&self, key: &str) -> Option<Arc<TaskSocketPool>> {
        self.pools.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Borrow a connection from the pool registered under `key`.
    pub async fn get_socket(&self, key: &str) -> Option<TaskSocket> {
        let pool = self.get_pool(key)?;
        pool.get().await
    }

    /// Borrow one connection from every pool; pools that yield none are skipped.
    pub async fn get_sockets(&self) -> Vec<TaskSocket> {
        let pools = self.pools();
        join_all(pools.iter().map(|pool| pool.get()))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn pools(&self) -> Vec<Arc<TaskSocketPool>> {
        self.pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.pools.len()
    }

    /// Close and remove every pool. Idempotent.
    pub async fn close(&self) {
        let pools = self.pools();
        self.pools.clear();
        join_all(pools.iter().map(|pool| pool.close())).await;
        if !pools.is_empty() {
            info!(count = pools.len(), "Task socket pool manager closed");
        }
    }
}
