//! KubernetesCluster Custom Resource Definition
//!
//! A KubernetesCluster is the catalog record for one registered remote
//! cluster. It lives in the management namespace, points at the secret
//! holding the cluster's sanitized kubeconfig, and names the namespace on the
//! remote cluster where meshplane writes. Downstream discovery loops read
//! these records; only the registry writes them.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::DISCOVERED_BY_LABEL;

/// Specification for a KubernetesCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "discovery.meshplane.dev",
    version = "v1alpha1",
    kind = "KubernetesCluster",
    plural = "kubernetesclusters",
    shortname = "kc",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"WriteNamespace","type":"string","jsonPath":".spec.writeNamespace"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.secretRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesClusterSpec {
    /// Secret on the management cluster holding the kubeconfig
    pub secret_ref: SecretRef,

    /// Namespace on the remote cluster where meshplane writes
    pub write_namespace: String,

    /// Cluster DNS domain, when it differs from `cluster.local`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
}

/// Reference to a namespaced secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

impl KubernetesCluster {
    /// Full name of the CRD backing this type
    pub const CRD_NAME: &'static str = "kubernetesclusters.discovery.meshplane.dev";

    /// Build a record with the discovery-source label set
    pub fn record(
        name: &str,
        namespace: &str,
        discovery_source: &str,
        spec: KubernetesClusterSpec,
    ) -> Self {
        let mut cluster = Self::new(name, spec);
        cluster.metadata.namespace = Some(namespace.to_string());
        cluster.metadata.labels = Some(BTreeMap::from([(
            DISCOVERED_BY_LABEL.to_string(),
            discovery_source.to_string(),
        )]));
        cluster
    }

    /// Value of the discovery-source label, if set
    pub fn discovered_by(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(DISCOVERED_BY_LABEL))
            .map(String::as_str)
    }
}
