//! Connection lookup: record name to live connection

use kube::ResourceExt;
use tracing::debug;

use super::{decode_kubeconfig, ClusterRegistry};
use crate::crd::KubernetesCluster;
use crate::kubeconfig::ClusterConnection;
use crate::{Error, Result};

/// A registered cluster together with its decoded connection
#[derive(Debug, Clone)]
pub struct ResolvedCluster {
    /// The catalog record
    pub record: KubernetesCluster,
    /// Connection decoded from the persisted kubeconfig
    pub connection: ClusterConnection,
}

/// Resolve a registered cluster's persisted connection
///
/// Returns [`Error::ResourceTypeMissing`] when the KubernetesCluster type is
/// not installed on the management cluster, and [`Error::ClusterNotRegistered`]
/// when no record carries the name. Callers tearing a cluster down treat both
/// as "nothing to do".
pub async fn resolve(registry: &dyn ClusterRegistry, cluster: &str) -> Result<ResolvedCluster> {
    if !registry.record_type_installed().await? {
        return Err(Error::ResourceTypeMissing {
            kind: KubernetesCluster::CRD_NAME.to_string(),
        });
    }

    let record = registry
        .list()
        .await?
        .into_iter()
        .find(|r| r.name_any() == cluster)
        .ok_or_else(|| Error::ClusterNotRegistered {
            cluster: cluster.to_string(),
        })?;

    let secret = registry
        .get_kubeconfig_secret(&record.spec.secret_ref)
        .await?;
    let kubeconfig = decode_kubeconfig(&secret, cluster)?;
    let connection = ClusterConnection::from_persisted(&kubeconfig, cluster)?;

    debug!(cluster = %cluster, server = %connection.server(), "Resolved cluster connection");
    Ok(ResolvedCluster { record, connection })
}
