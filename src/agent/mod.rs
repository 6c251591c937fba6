//! CSR agent lifecycle
//!
//! The agent is installed into every registered cluster's write namespace as
//! a package release. [`AgentManager`] turns the package manager's
//! "already installed" and "release not found" conditions into success, so
//! installing twice and uninstalling twice are both no-ops.

mod helm;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::config::{AgentConfig, VERSION_PLACEHOLDER};
use crate::kubeconfig::ClusterConnection;
use crate::{Error, Result};

pub use helm::{classify_failure, install_args, uninstall_args, HelmCli};

/// Where a chart comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartSource {
    /// Published chart archive
    Remote(String),
    /// Locally packaged chart, for development
    Local(PathBuf),
}

/// A package install against one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    /// Release name
    pub release: String,
    /// Target namespace
    pub namespace: String,
    /// Chart to install
    pub chart: ChartSource,
    /// Create the namespace if it does not exist
    pub create_namespace: bool,
    /// Chart values passed with `--set`
    pub values: BTreeMap<String, String>,
}

/// Declarative package manager
///
/// Implementations report an existing release on install as
/// [`Error::ReleaseAlreadyInstalled`] and a missing release on uninstall as
/// [`Error::ReleaseNotFound`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Install a release
    async fn install(&self, connection: &ClusterConnection, request: &InstallRequest) -> Result<()>;

    /// Uninstall a release
    async fn uninstall(
        &self,
        connection: &ClusterConnection,
        namespace: &str,
        release: &str,
    ) -> Result<()>;
}

/// Idempotent install and removal of the CSR agent
pub struct AgentManager {
    package_manager: Arc<dyn PackageManager>,
    config: AgentConfig,
}

impl AgentManager {
    /// Create a manager over a package manager
    pub fn new(package_manager: Arc<dyn PackageManager>, config: AgentConfig) -> Self {
        Self {
            package_manager,
            config,
        }
    }

    /// Release name used for the agent
    pub fn release_name(&self) -> &str {
        &self.config.release_name
    }

    /// API group of the CRDs the agent installs
    pub fn crd_group(&self) -> &str {
        &self.config.crd_group
    }

    /// Resolve the agent chart: the published archive for the configured
    /// version, or the local development package
    pub fn package(&self, use_dev_package: bool) -> ChartSource {
        if use_dev_package {
            ChartSource::Local(self.config.local_chart_path.clone())
        } else {
            ChartSource::Remote(
                self.config
                    .chart_uri_template
                    .replace(VERSION_PLACEHOLDER, &self.config.chart_version),
            )
        }
    }

    /// Install a release; an existing release with the same name is success
    pub async fn install(
        &self,
        connection: &ClusterConnection,
        namespace: &str,
        release: &str,
        package: ChartSource,
        create_namespace: bool,
    ) -> Result<()> {
        let request = InstallRequest {
            release: release.to_string(),
            namespace: namespace.to_string(),
            chart: package,
            create_namespace,
            values: BTreeMap::new(),
        };

        match self.package_manager.install(connection, &request).await {
            Ok(()) => {
                info!(release = %release, namespace = %namespace, "Agent installed");
                Ok(())
            }
            Err(Error::ReleaseAlreadyInstalled { .. }) => {
                debug!(release = %release, namespace = %namespace, "Agent already installed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Uninstall a release; a release with no history is success
    pub async fn uninstall(
        &self,
        connection: &ClusterConnection,
        namespace: &str,
        release: &str,
    ) -> Result<()> {
        match self
            .package_manager
            .uninstall(connection, namespace, release)
            .await
        {
            Ok(()) => {
                info!(release = %release, namespace = %namespace, "Agent uninstalled");
                Ok(())
            }
            Err(Error::ReleaseNotFound { .. }) => {
                debug!(release = %release, namespace = %namespace, "No agent release to uninstall");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
