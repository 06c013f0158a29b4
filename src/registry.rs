//! Engines hosted by one process, keyed by protocol version.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::dht::Dht;
use crate::rpc::Transport;

/// Registry of running [`Dht`] engines, one per protocol version.
pub struct DhtRegistry<T: Transport> {
    engines: RwLock<HashMap<u32, Dht<T>>>,
}

impl<T: Transport> Default for DhtRegistry<T> {
    fn default() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Transport> DhtRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dht` for `version`, returning the engine it replaces.
    pub async fn register(&self, version: u32, dht: Dht<T>) -> Option<Dht<T>> {
        debug!(version, id = %dht.our_id(), "registering dht");
        self.engines.write().await.insert(version, dht)
    }

    pub async fn get(&self, version: u32) -> Option<Dht<T>> {
        self.engines.read().await.get(&version).cloned()
    }

    pub async fn remove(&self, version: u32) -> Option<Dht<T>> {
        self.engines.write().await.remove(&version)
    }

    pub async fn versions(&self) -> Vec<u32> {
        let mut versions: Vec<u32> = self.engines.read().await.keys().copied().collect();
        versions.sort_unstable();
        versions
    }

    /// Stop every registered engine and empty the registry.
    pub async fn shutdown_all(&self) {
        let engines: Vec<Dht<T>> = self.engines.write().await.drain().map(|(_, d)| d).collect();
        for dht in engines {
            dht.shutdown().await;
        }
    }
}
