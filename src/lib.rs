//! Meshplane - cross-cluster trust bootstrap for a federated service mesh
//!
//! Meshplane federates remote Kubernetes clusters under a single management
//! cluster. Registering a cluster establishes a trust relationship with it,
//! installs the per-cluster CSR agent, and records the cluster in a catalog on
//! the management cluster. Deregistering reverses every one of those steps
//! and is safe to re-run or race against itself.
//!
//! # Architecture
//!
//! Two API servers are involved and nothing is transactional across them:
//! - The management cluster holds one `KubernetesCluster` record and one
//!   kubeconfig secret per registered cluster
//! - Each remote cluster holds a service account, its role bindings, the
//!   agent release, and whatever the agent creates (certificate secrets, CRDs)
//!
//! Every step is individually idempotent, so the documented recovery for any
//! failure is to invoke the same operation again.
//!
//! # Modules
//!
//! - [`lifecycle`] - Registration and deregistration orchestrators
//! - [`credentials`] - Service account bootstrap and token exchange
//! - [`kubeconfig`] - Connection descriptors and credential sanitization
//! - [`agent`] - CSR agent install/uninstall through a package manager
//! - [`registry`] - Cluster catalog on the management cluster
//! - [`crd_lifecycle`] - Removal of agent-owned CRDs by API group
//! - [`remote`] - Remote cluster API seam and per-cluster client cache
//! - [`crd`] - Custom Resource Definitions (KubernetesCluster)
//! - [`config`] - Configuration threaded through the protocol
//! - [`retry`] - Cancellable bounded retry
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod agent;
pub mod config;
pub mod crd;
pub mod crd_lifecycle;
pub mod credentials;
pub mod error;
pub mod kubeconfig;
pub mod lifecycle;
pub mod registry;
pub mod remote;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default namespace on the management cluster for records and kubeconfig secrets
pub const DEFAULT_MANAGEMENT_NAMESPACE: &str = "meshplane-system";

/// Default release name of the CSR agent
pub const DEFAULT_AGENT_RELEASE: &str = "csr-agent";

/// API group of the CRDs the CSR agent installs on remote clusters
pub const AGENT_CRD_GROUP: &str = "security.meshplane.dev";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "meshplane";

// =============================================================================
// Labels and Secret Types
// =============================================================================

/// Label marking objects created on remote clusters by registration
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on objects meshplane owns
pub const MANAGED_BY_VALUE: &str = "meshplane";

/// Label on a cluster record naming how the cluster was discovered
pub const DISCOVERED_BY_LABEL: &str = "discovery.meshplane.dev/discovered-by";

/// Discovery source used for clusters registered by hand
pub const MANUAL_DISCOVERY_SOURCE: &str = "manual";

/// Type of the secret holding a registered cluster's kubeconfig
pub const KUBECONFIG_SECRET_TYPE: &str = "meshplane.dev/kubeconfig";

/// Type of the intermediate certificate secrets the agent writes
pub const CERT_SECRET_TYPE: &str = "meshplane.dev/ca-issued-certificate";

/// Cluster role granted to the bootstrapped service account
pub const CLUSTER_ADMIN_ROLE: &str = "cluster-admin";

/// Label selector matching every object registration creates on a remote cluster
pub fn managed_by_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}
