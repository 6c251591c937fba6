//! Per-cluster client cache

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::Client;
use tracing::debug;

use super::{ClientProvider, KubeRemoteApi, RemoteClusterApi};
use crate::kubeconfig::ClusterConnection;
use crate::registry::{resolve, ClusterRegistry};
use crate::Result;

/// Caches one kube Client per registered cluster name
///
/// Cache misses resolve the cluster's persisted connection through the
/// registry. Entries live until [`ClientProvider::evict`] is called, which
/// deregistration and re-registration both do. An entry outlives the
/// kubeconfig secret it was built from.
pub struct KubeClientCache {
    registry: Arc<dyn ClusterRegistry>,
    clients: DashMap<String, Client>,
}

impl KubeClientCache {
    /// Create an empty cache backed by the given registry
    pub fn new(registry: Arc<dyn ClusterRegistry>) -> Self {
        Self {
            registry,
            clients: DashMap::new(),
        }
    }

    /// Number of cached clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the cache holds no clients
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[async_trait]
impl ClientProvider for KubeClientCache {
    async fn for_connection(
        &self,
        connection: &ClusterConnection,
    ) -> Result<Arc<dyn RemoteClusterApi>> {
        Ok(Arc::new(KubeRemoteApi::connect(connection).await?))
    }

    async fn for_cluster(&self, cluster: &str) -> Result<Arc<dyn RemoteClusterApi>> {
        if let Some(client) = self.clients.get(cluster) {
            return Ok(Arc::new(KubeRemoteApi::new(client.clone())));
        }

        let resolved = resolve(self.registry.as_ref(), cluster).await?;
        let client = resolved.connection.client().await?;
        self.clients.insert(cluster.to_string(), client.clone());
        debug!(cluster = %cluster, "Cached client for cluster");
        Ok(Arc::new(KubeRemoteApi::new(client)))
    }

    async fn for_resolved(
        &self,
        cluster: &str,
        connection: &ClusterConnection,
    ) -> Result<Arc<dyn RemoteClusterApi>> {
        let client = connection.client().await?;
        self.clients.insert(cluster.to_string(), client.clone());
        debug!(cluster = %cluster, "Cached client for resolved connection");
        Ok(Arc::new(KubeRemoteApi::new(client)))
    }

    fn cached(&self, cluster: &str) -> Option<Arc<dyn RemoteClusterApi>> {
        self.clients
            .get(cluster)
            .map(|client| Arc::new(KubeRemoteApi::new(client.clone())) as Arc<dyn RemoteClusterApi>)
    }

    fn evict(&self, cluster: &str) {
        if self.clients.remove(cluster).is_some() {
            debug!(cluster = %cluster, "Evicted cached client");
        }
    }
}
