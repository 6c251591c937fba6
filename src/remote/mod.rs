//! Remote cluster API seam
//!
//! [`RemoteClusterApi`] is the set of calls the protocol makes against a
//! remote cluster's API server. The kube-rs implementation is
//! [`KubeRemoteApi`]; tests substitute mocks or the in-memory fake.
//! [`ClientProvider`] hands out implementations, either for an explicit
//! connection or for a registered cluster by name, and remembers the ones
//! built for registered clusters.

mod cache;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::kubeconfig::ClusterConnection;
use crate::{Error, Result, FIELD_MANAGER};

pub use cache::KubeClientCache;

/// Calls made against a remote cluster
///
/// Single-object deletes surface NotFound as an error so callers can decide
/// whether it is benign. Label-selected deletes treat objects that vanish
/// mid-sweep as already deleted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteClusterApi: Send + Sync {
    /// Server-side apply a namespace
    async fn apply_namespace(&self, name: &str) -> Result<()>;

    /// Server-side apply a service account
    async fn apply_service_account(&self, service_account: &ServiceAccount) -> Result<()>;

    /// Server-side apply a cluster role binding
    async fn apply_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()>;

    /// Get a service account
    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount>;

    /// Get a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// List every secret in a namespace
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>>;

    /// Delete a secret
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete service accounts matching a label selector, returning how many were deleted
    async fn delete_service_accounts(&self, namespace: &str, selector: &str) -> Result<usize>;

    /// Delete cluster role bindings matching a label selector, returning how many were deleted
    async fn delete_cluster_role_bindings(&self, selector: &str) -> Result<usize>;

    /// List every CRD on the cluster
    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>>;

    /// Delete a CRD
    async fn delete_crd(&self, name: &str) -> Result<()>;
}

/// Hands out API handles for remote clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// API handle for an explicit connection (not cached)
    async fn for_connection(
        &self,
        connection: &ClusterConnection,
    ) -> Result<Arc<dyn RemoteClusterApi>>;

    /// API handle for a registered cluster, keyed by cluster name
    async fn for_cluster(&self, cluster: &str) -> Result<Arc<dyn RemoteClusterApi>>;

    /// API handle built from a connection already resolved for `cluster`
    ///
    /// Replaces any cached handle for the cluster, so later calls to
    /// [`ClientProvider::cached`] keep working after the persisted
    /// connection is gone.
    async fn for_resolved(
        &self,
        cluster: &str,
        connection: &ClusterConnection,
    ) -> Result<Arc<dyn RemoteClusterApi>>;

    /// Cached handle for a cluster, without touching the registry
    fn cached(&self, cluster: &str) -> Option<Arc<dyn RemoteClusterApi>>;

    /// Forget any cached handle for a cluster
    fn evict(&self, cluster: &str);
}

/// kube-rs implementation of [`RemoteClusterApi`]
#[derive(Clone)]
pub struct KubeRemoteApi {
    client: Client,
}

impl KubeRemoteApi {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build from a connection descriptor
    pub async fn connect(connection: &ClusterConnection) -> Result<Self> {
        Ok(Self::new(connection.client().await?))
    }
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl RemoteClusterApi for KubeRemoteApi {
    async fn apply_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Apply(&namespace),
        )
        .await?;
        Ok(())
    }

    async fn apply_service_account(&self, service_account: &ServiceAccount) -> Result<()> {
        let namespace = service_account
            .namespace()
            .ok_or_else(|| Error::internal("service account has no namespace"))?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &service_account.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(service_account),
        )
        .await?;
        Ok(())
    }

    async fn apply_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.patch(
            &binding.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(binding),
        )
        .await?;
        Ok(())
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_service_accounts(&self, namespace: &str, selector: &str) -> Result<usize> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let accounts = api.list(&ListParams::default().labels(selector)).await?;
        let mut deleted = 0;
        for sa in accounts.items {
            let name = sa.name_any();
            if ignore_not_found(api.delete(&name, &DeleteParams::default()).await.map(|_| ()))? {
                debug!(namespace = %namespace, service_account = %name, "Deleted service account");
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_cluster_role_bindings(&self, selector: &str) -> Result<usize> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let bindings = api.list(&ListParams::default().labels(selector)).await?;
        let mut deleted = 0;
        for binding in bindings.items {
            let name = binding.name_any();
            if ignore_not_found(api.delete(&name, &DeleteParams::default()).await.map(|_| ()))? {
                debug!(binding = %name, "Deleted cluster role binding");
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_crd(&self, name: &str) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
