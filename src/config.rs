//! Configuration for the registration protocol.
//!
//! All tunables live in [`MeshplaneConfig`], which is built once by the caller
//! (from a YAML file, defaults, or CLI flags) and threaded explicitly into the
//! components that need it. Nothing under this crate reads process-wide
//! environment state while running the protocol.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::{Error, Result, DEFAULT_MANAGEMENT_NAMESPACE};

/// Placeholder substituted in the remote chart URI
pub const VERSION_PLACEHOLDER: &str = "{version}";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshplaneConfig {
    /// Namespace on the management cluster holding records and kubeconfig secrets
    pub management_namespace: String,
    /// Cluster agent package settings
    pub agent: AgentConfig,
    /// Budget for waiting on the service account token secret
    pub token_poll: TokenPollConfig,
    /// Path or name of the helm binary
    pub helm_binary: PathBuf,
}

impl Default for MeshplaneConfig {
    fn default() -> Self {
        Self {
            management_namespace: DEFAULT_MANAGEMENT_NAMESPACE.to_string(),
            agent: AgentConfig::default(),
            token_poll: TokenPollConfig::default(),
            helm_binary: PathBuf::from("helm"),
        }
    }
}

impl MeshplaneConfig {
    /// Load configuration from a YAML file, or use defaults when no path is given.
    ///
    /// Missing fields in the file fall back to their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::internal_with_context(
                "config",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::from_yaml(&data)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(data)
            .map_err(|e| Error::serialization(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.management_namespace.is_empty() {
            return Err(Error::internal_with_context(
                "config",
                "managementNamespace must not be empty",
            ));
        }
        if self.agent.release_name.is_empty() {
            return Err(Error::internal_with_context(
                "config",
                "agent.releaseName must not be empty",
            ));
        }
        if !self.agent.chart_uri_template.contains(VERSION_PLACEHOLDER) {
            return Err(Error::internal_with_context(
                "config",
                format!(
                    "agent.chartUriTemplate must contain {}",
                    VERSION_PLACEHOLDER
                ),
            ));
        }
        if self.token_poll.max_attempts == 0 {
            return Err(Error::internal_with_context(
                "config",
                "tokenPoll.maxAttempts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Cluster agent package settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Release name of the agent in every remote write namespace
    pub release_name: String,
    /// Remote chart archive URI; `{version}` is replaced by `chart_version`
    pub chart_uri_template: String,
    /// Chart version used with the remote URI
    pub chart_version: String,
    /// Locally packaged chart used for development installs
    pub local_chart_path: PathBuf,
    /// API group of the CRDs the agent installs
    pub crd_group: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            release_name: crate::DEFAULT_AGENT_RELEASE.to_string(),
            chart_uri_template:
                "https://charts.meshplane.dev/csr-agent/csr-agent-{version}.tgz".to_string(),
            chart_version: env!("CARGO_PKG_VERSION").to_string(),
            local_chart_path: PathBuf::from("_output/helm/charts/csr-agent"),
            crd_group: crate::AGENT_CRD_GROUP.to_string(),
        }
    }
}

/// Backoff used while waiting for the service account token secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenPollConfig {
    /// Delay before the second attempt, in milliseconds
    pub initial_delay_ms: u64,
    /// Growth factor applied after every attempt
    pub multiplier: f64,
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Upper bound on a single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for TokenPollConfig {
    fn default() -> Self {
        let retry = RetryConfig::token_poll();
        Self {
            initial_delay_ms: retry.initial_delay.as_millis() as u64,
            multiplier: retry.backoff_multiplier,
            max_attempts: retry.max_attempts,
            max_delay_ms: retry.max_delay.as_millis() as u64,
        }
    }
}

impl TokenPollConfig {
    /// Convert into the retry combinator's configuration (no jitter).
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.multiplier,
            jitter: false,
        }
    }
}
