//! Inter-node forwarding fabric
//!
//! Tunnels whose two ends land on different gateway nodes are carried over
//! pooled TCP connections multiplexed by the frame protocol in [frame].

pub mod conn;
pub mod frame;
pub mod listener;
pub mod stream;

use self::conn::{CrossNodeConn, NodeConnectionPool, PoolError, PoolOptions};
use crate::{session::state_store::ConnectionStateStore, utils::types::NodeId};
use hashbrown::HashMap;
use log::debug;
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

/// Port a peer's cross-node listener is assumed to be on when the store
/// holds no address record for it
pub const DEFAULT_CROSS_NODE_PORT: u16 = 50052;

/// Interval between idle-connection scrubs
const SCRUB_INTERVAL: Duration = Duration::from_secs(30);

/// Table of per-peer connection pools
pub struct CrossNodePool {
    node_id: NodeId,
    state_store: Arc<ConnectionStateStore>,
    options: PoolOptions,
    pools: RwLock<HashMap<NodeId, Arc<NodeConnectionPool>>>,
}

impl CrossNodePool {
    pub fn new(
        node_id: NodeId,
        state_store: Arc<ConnectionStateStore>,
        options: PoolOptions,
    ) -> Self {
        Self {
            node_id,
            state_store,
            options,
            pools: Default::default(),
        }
    }

    /// Obtains a pooled connection to a peer node
    pub async fn get(&self, peer_node_id: &str) -> Result<Arc<CrossNodeConn>, PoolError> {
        if peer_node_id == self.node_id {
            return Err(PoolError::SelfDial(self.node_id.clone()));
        }

        let pool = self.pool_for(peer_node_id).await;
        pool.get().await
    }

    /// Lazily creates the pool for a peer
    async fn pool_for(&self, peer_node_id: &str) -> Arc<NodeConnectionPool> {
        if let Some(pool) = self.pools.read().get(peer_node_id) {
            return pool.clone();
        }

        // Resolve the address before taking the write lock
        let node_addr = self.lookup_addr(peer_node_id).await;

        let pools = &mut *self.pools.write();
        if let Some(pool) = pools.get(peer_node_id) {
            return pool.clone();
        }

        let pool = Arc::new(NodeConnectionPool::new(
            peer_node_id.to_string(),
            node_addr,
            self.options,
        ));
        pools.insert(peer_node_id.to_string(), pool.clone());
        pool
    }

    /// Address of a peer's cross-node listener, `{node}:50052` when the
    /// store has no record (read failures fall back too)
    async fn lookup_addr(&self, peer_node_id: &str) -> String {
        match self.state_store.node_address(peer_node_id).await {
            Ok(Some(addr)) => addr,
            Ok(None) => format!("{}:{}", peer_node_id, DEFAULT_CROSS_NODE_PORT),
            Err(err) => {
                debug!(
                    "address lookup for node {} failed, using default: {}",
                    peer_node_id, err
                );
                format!("{}:{}", peer_node_id, DEFAULT_CROSS_NODE_PORT)
            }
        }
    }

    /// Returns a healthy connection to its pool
    pub fn release(&self, conn: Arc<CrossNodeConn>) {
        if let Some(pool) = self.pools.read().get(conn.node_id()) {
            pool.put(conn);
        }
    }

    /// Drops a broken connection from its pool
    pub fn discard(&self, conn: Arc<CrossNodeConn>) {
        if let Some(pool) = self.pools.read().get(conn.node_id()) {
            pool.remove(conn);
        }
    }

    /// Runs one idle-cleanup pass over every peer pool
    pub async fn scrub_idle(&self) {
        let pools: Vec<Arc<NodeConnectionPool>> =
            self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.cleanup_idle().await;
        }
    }

    /// Closes every peer pool
    pub async fn close_all(&self) {
        let pools: Vec<Arc<NodeConnectionPool>> =
            self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

/// Background task scrubbing idle pooled connections until shutdown
pub async fn run_idle_scrubber(pool: Arc<CrossNodePool>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(SCRUB_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => pool.scrub_idle().await,
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CrossNodePool, PoolError, PoolOptions};
    use crate::{session::state_store::ConnectionStateStore, storage::MemoryStorage};
    use std::{sync::Arc, time::Duration};

    fn pool(node_id: &str) -> CrossNodePool {
        let storage = Arc::new(MemoryStorage::default());
        let state_store = Arc::new(ConnectionStateStore::new(
            storage,
            node_id.to_string(),
            Duration::from_secs(300),
        ));
        CrossNodePool::new(node_id.to_string(), state_store, PoolOptions::default())
    }

    #[tokio::test]
    async fn test_self_dial_rejected() {
        let pool = pool("node-a");
        assert!(matches!(
            pool.get("node-a").await,
            Err(PoolError::SelfDial(_))
        ));
    }

    #[tokio::test]
    async fn test_address_fallback() {
        let pool = pool("node-a");
        assert_eq!(pool.lookup_addr("node-b").await, "node-b:50052");
    }

    #[tokio::test]
    async fn test_store_address_preferred() {
        let storage = Arc::new(MemoryStorage::default());
        let state_store = Arc::new(ConnectionStateStore::new(
            storage,
            "node-b".to_string(),
            Duration::from_secs(300),
        ));
        state_store.register_node_address("10.1.2.3:9000").await.unwrap();

        let pool = CrossNodePool::new(
            "node-a".to_string(),
            state_store,
            PoolOptions::default(),
        );
        assert_eq!(pool.lookup_addr("node-b").await, "10.1.2.3:9000");
    }
}
