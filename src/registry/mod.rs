//! Cluster registry on the management cluster
//!
//! The registry is the source of truth for which remote clusters are
//! federated. Each registered cluster has exactly two objects in the
//! management namespace:
//! - a [`KubernetesCluster`] record
//! - a kubeconfig secret named after the cluster, referenced by the record
//!
//! Both are written with server-side apply, so re-registering with overwrite
//! is an upsert. Deletes treat NotFound as success so that concurrent or
//! repeated deregistrations do not fail each other.

mod lookup;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, CustomResourceExt, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{KubernetesCluster, SecretRef};
use crate::{
    Error, Result, FIELD_MANAGER, KUBECONFIG_SECRET_TYPE, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};

pub use lookup::{resolve, ResolvedCluster};

/// Catalog of registered clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// Install or update the KubernetesCluster CRD
    async fn ensure_record_type(&self) -> Result<()>;

    /// Whether the KubernetesCluster CRD is served
    async fn record_type_installed(&self) -> Result<bool>;

    /// Get a record by cluster name
    async fn get(&self, name: &str) -> Result<Option<KubernetesCluster>>;

    /// List every record in the management namespace
    async fn list(&self) -> Result<Vec<KubernetesCluster>>;

    /// Write the kubeconfig secret, then the record that references it
    async fn upsert(&self, record: &KubernetesCluster, kubeconfig: &str) -> Result<()>;

    /// Delete a record; a record that is already gone is not an error
    async fn delete(&self, name: &str) -> Result<()>;

    /// Get the kubeconfig secret a record references
    async fn get_kubeconfig_secret(&self, secret_ref: &SecretRef) -> Result<Secret>;

    /// Delete the kubeconfig secret a record references; already gone is not an error
    async fn delete_kubeconfig_secret(&self, secret_ref: &SecretRef) -> Result<()>;
}

/// Build the secret that stores a cluster's kubeconfig
///
/// The kubeconfig is stored under a key equal to the cluster name.
pub fn kubeconfig_secret(cluster: &str, secret_ref: &SecretRef, kubeconfig: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(secret_ref.name.clone()),
            namespace: Some(secret_ref.namespace.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some(KUBECONFIG_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            cluster.to_string(),
            ByteString(kubeconfig.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Extract the kubeconfig stored for `cluster` from its secret
pub fn decode_kubeconfig(secret: &Secret, cluster: &str) -> Result<String> {
    let malformed = || Error::MalformedSecret {
        secret: secret.name_any(),
        namespace: secret.namespace().unwrap_or_default(),
        key: cluster.to_string(),
    };
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(cluster))
        .ok_or_else(malformed)?;
    String::from_utf8(bytes.0.clone()).map_err(|_| malformed())
}

/// kube-rs implementation of [`ClusterRegistry`]
pub struct KubeClusterRegistry {
    client: Client,
    namespace: String,
}

impl KubeClusterRegistry {
    /// Registry over the given management namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn records(&self) -> Api<KubernetesCluster> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterRegistry for KubeClusterRegistry {
    async fn ensure_record_type(&self) -> Result<()> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();

        info!("Installing KubernetesCluster CRD...");
        crds.patch(
            KubernetesCluster::CRD_NAME,
            &params,
            &Patch::Apply(&KubernetesCluster::crd()),
        )
        .await?;
        Ok(())
    }

    async fn record_type_installed(&self) -> Result<bool> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match crds.get(KubernetesCluster::CRD_NAME).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<KubernetesCluster>> {
        Ok(self.records().get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<KubernetesCluster>> {
        Ok(self.records().list(&ListParams::default()).await?.items)
    }

    async fn upsert(&self, record: &KubernetesCluster, kubeconfig: &str) -> Result<()> {
        let name = record.name_any();
        let secret_ref = &record.spec.secret_ref;
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        secrets
            .patch(
                &secret_ref.name,
                &params,
                &Patch::Apply(&kubeconfig_secret(&name, secret_ref, kubeconfig)),
            )
            .await?;

        self.records()
            .patch(&name, &params, &Patch::Apply(record))
            .await?;

        info!(cluster = %name, namespace = %self.namespace, "Cluster record written");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.records().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(cluster = %name, "Cluster record already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_kubeconfig_secret(&self, secret_ref: &SecretRef) -> Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        Ok(secrets.get(&secret_ref.name).await?)
    }

    async fn delete_kubeconfig_secret(&self, secret_ref: &SecretRef) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        match secrets
            .delete(&secret_ref.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(secret = %secret_ref.name, "Kubeconfig secret already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
