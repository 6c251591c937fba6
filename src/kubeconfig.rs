//! Cluster connection descriptors
//!
//! A [`ClusterConnection`] is a kubeconfig plus the context it targets. It is
//! the single connection abstraction used throughout the crate: the caller's
//! administrative connection, the sanitized connection that authenticates only
//! as the bootstrapped service account, and the persisted connection decoded
//! back out of the management cluster are all the same type.
//!
//! The kubeconfig model is deliberately small. Cluster and user entries keep
//! any fields they do not name in a flattened map so that round-tripping a
//! real kubeconfig does not drop transport settings such as
//! `insecure-skip-tls-verify` or `proxy-url`.

use std::collections::BTreeMap;
use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Discovery};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kubeconfig file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubeconfigFile {
    /// API version
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Kind (always "Config")
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Clusters
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// Users
    #[serde(default)]
    pub users: Vec<NamedUser>,
    /// Contexts
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Current context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Config".to_string()
}

/// Cluster entry in kubeconfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    /// Transport settings not modelled above
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// User entry in kubeconfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    #[serde(default)]
    pub user: UserConfig,
}

/// User configuration
///
/// Only the bearer token is named; certificates, exec plugins, basic auth and
/// anything else live in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Every other credential field
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl UserConfig {
    /// A user that authenticates with the given bearer token and nothing else
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            extra: BTreeMap::new(),
        }
    }
}

/// Context entry in kubeconfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    #[serde(default)]
    pub user: String,
    /// Default namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl KubeconfigFile {
    /// Parse a kubeconfig from YAML (JSON is accepted too)
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data)
            .map_err(|e| Error::kubeconfig(format!("failed to parse kubeconfig: {}", e)))
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization(format!("failed to serialize kubeconfig: {}", e)))
    }

    /// Look up a context by name
    pub fn context(&self, name: &str) -> Result<&ContextConfig> {
        self.contexts
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.context)
            .ok_or_else(|| Error::ContextNotFound {
                context: name.to_string(),
            })
    }

    /// Look up the cluster a context references
    pub fn cluster_for_context(&self, context: &str) -> Result<&ClusterConfig> {
        let ctx = self.context(context)?;
        self.clusters
            .iter()
            .find(|c| c.name == ctx.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| Error::KubeconfigClusterNotFound {
                cluster: ctx.cluster.clone(),
                context: context.to_string(),
            })
    }

    fn user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.name == name).map(|u| &u.user)
    }
}

/// A kubeconfig bound to one of its contexts
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConnection {
    kubeconfig: KubeconfigFile,
    context: String,
}

impl ClusterConnection {
    /// Bind a kubeconfig to a context, or to its current context when `None`
    ///
    /// Fails with [`Error::ContextNotFound`] or [`Error::KubeconfigClusterNotFound`]
    /// when the context or the cluster it references is absent.
    pub fn from_kubeconfig(kubeconfig: KubeconfigFile, context: Option<&str>) -> Result<Self> {
        let context = match context {
            Some(c) => c.to_string(),
            None => kubeconfig
                .current_context
                .clone()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| Error::kubeconfig("no context given and no current-context set"))?,
        };
        kubeconfig.cluster_for_context(&context)?;
        Ok(Self {
            kubeconfig,
            context,
        })
    }

    /// Parse kubeconfig YAML and bind it to a context
    pub fn from_yaml(data: &str, context: Option<&str>) -> Result<Self> {
        Self::from_kubeconfig(KubeconfigFile::from_yaml(data)?, context)
    }

    /// Read a kubeconfig file and bind it to a context
    pub fn from_path(path: &Path, context: Option<&str>) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::kubeconfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&data, context)
    }

    /// Rebind the same kubeconfig to another context
    pub fn with_context(&self, context: &str) -> Result<Self> {
        Self::from_kubeconfig(self.kubeconfig.clone(), Some(context))
    }

    /// Name of the bound context
    pub fn context(&self) -> &str {
        &self.context
    }

    /// API server URL of the bound context's cluster
    pub fn server(&self) -> &str {
        self.cluster().map(|c| c.server.as_str()).unwrap_or_default()
    }

    /// The underlying kubeconfig
    pub fn raw(&self) -> &KubeconfigFile {
        &self.kubeconfig
    }

    /// Serialize the underlying kubeconfig to YAML
    pub fn to_yaml(&self) -> Result<String> {
        self.kubeconfig.to_yaml()
    }

    fn cluster(&self) -> Result<&ClusterConfig> {
        self.kubeconfig.cluster_for_context(&self.context)
    }

    fn context_config(&self) -> Result<&ContextConfig> {
        self.kubeconfig.context(&self.context)
    }

    /// Fully resolved client configuration for the bound context
    pub async fn rest_config(&self) -> Result<Config> {
        let yaml = self.to_yaml()?;
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&yaml)
            .map_err(|e| Error::kubeconfig(format!("invalid kubeconfig: {}", e)))?;
        let options = KubeConfigOptions {
            context: Some(self.context.clone()),
            ..Default::default()
        };
        Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| {
                Error::kubeconfig(format!(
                    "failed to build config for context {}: {}",
                    self.context, e
                ))
            })
    }

    /// Build an API client for the bound context
    pub async fn client(&self) -> Result<Client> {
        let config = self.rest_config().await?;
        Ok(Client::try_from(config)?)
    }

    /// Run API discovery against the bound context's cluster
    pub async fn discovery(&self) -> Result<Discovery> {
        let client = self.client().await?;
        Ok(Discovery::new(client).run().await?)
    }

    /// Replace every client credential with a single bearer token
    ///
    /// The result contains only the bound context, its cluster entry unchanged
    /// (same server and transport settings), and a user carrying `token` and
    /// nothing else.
    pub fn sanitize(&self, token: &str) -> Result<Self> {
        let ctx = self.context_config()?;
        let cluster = self.cluster()?;
        let user_name = if ctx.user.is_empty() {
            self.context.clone()
        } else {
            ctx.user.clone()
        };

        let kubeconfig = KubeconfigFile {
            api_version: default_api_version(),
            kind: default_kind(),
            clusters: vec![NamedCluster {
                name: ctx.cluster.clone(),
                cluster: cluster.clone(),
            }],
            users: vec![NamedUser {
                name: user_name.clone(),
                user: UserConfig::bearer(token),
            }],
            contexts: vec![NamedContext {
                name: self.context.clone(),
                context: ContextConfig {
                    cluster: ctx.cluster.clone(),
                    user: user_name,
                    namespace: ctx.namespace.clone(),
                },
            }],
            current_context: Some(self.context.clone()),
        };

        Ok(Self {
            kubeconfig,
            context: self.context.clone(),
        })
    }

    /// Convert to the single-context kubeconfig stored for a registered cluster
    ///
    /// `context` must exist in this kubeconfig and reference a cluster that
    /// exists. Every entry in the output is named `cluster_name`.
    pub fn to_persisted(&self, context: &str, cluster_name: &str) -> Result<String> {
        let ctx = self.kubeconfig.context(context)?;
        let cluster = self.kubeconfig.cluster_for_context(context)?;
        let user = self.kubeconfig.user(&ctx.user).cloned().unwrap_or_default();

        KubeconfigFile {
            api_version: default_api_version(),
            kind: default_kind(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: cluster.clone(),
            }],
            users: vec![NamedUser {
                name: cluster_name.to_string(),
                user,
            }],
            contexts: vec![NamedContext {
                name: cluster_name.to_string(),
                context: ContextConfig {
                    cluster: cluster_name.to_string(),
                    user: cluster_name.to_string(),
                    namespace: None,
                },
            }],
            current_context: Some(cluster_name.to_string()),
        }
        .to_yaml()
    }

    /// Decode a persisted kubeconfig back into a connection
    pub fn from_persisted(data: &str, cluster_name: &str) -> Result<Self> {
        Self::from_yaml(data, Some(cluster_name))
    }
}
