//! Error types for cluster registration and deregistration
//!
//! Errors are structured with fields to aid debugging in production.
//! Step-level failures wrap the underlying cause together with the cluster
//! name and the step that failed, so the operator can see exactly how far a
//! registration or deregistration progressed before it stopped.

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Steps of the registration protocol, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStep {
    /// Checking whether the cluster is already registered
    CheckExisting,
    /// Connecting to the remote cluster with the caller's credentials
    ConnectRemote,
    /// Creating the service account, binding roles and waiting for its token
    BootstrapCredentials,
    /// Replacing ambient credentials with the service account token
    SanitizeConnection,
    /// Installing the cluster agent
    InstallAgent,
    /// Writing the kubeconfig secret and cluster record
    PersistRecord,
}

impl fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStep::CheckExisting => write!(f, "FailedToCheckExistingRegistration"),
            RegistrationStep::ConnectRemote => write!(f, "FailedToConnectToRemoteCluster"),
            RegistrationStep::BootstrapCredentials => write!(f, "FailedToBootstrapCredentials"),
            RegistrationStep::SanitizeConnection => write!(f, "FailedToSanitizeKubeConfig"),
            RegistrationStep::InstallAgent => write!(f, "FailedToInstallCsrAgent"),
            RegistrationStep::PersistRecord => write!(f, "FailedToWriteClusterRecord"),
        }
    }
}

/// Steps of the deregistration protocol, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregistrationStep {
    /// Resolving the persisted connection for the cluster
    FindClusterCredentials,
    /// Uninstalling the cluster agent release
    UninstallCsrAgent,
    /// Obtaining an API client for the remote cluster
    GetRemoteClient,
    /// Purging intermediate certificate secrets in the write namespace
    CleanUpCertSecrets,
    /// Deleting the persisted kubeconfig secret on the management cluster
    CleanUpKubeConfigSecret,
    /// Deleting the cluster record on the management cluster
    CleanUpKubeConfigCrd,
    /// Deleting service accounts (and their role bindings) by label
    CleanUpServiceAccount,
    /// Removing the agent's CRDs from the remote cluster
    RemoveCrds,
}

impl fmt::Display for DeregistrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeregistrationStep::FindClusterCredentials => {
                write!(f, "FailedToFindClusterCredentials")
            }
            DeregistrationStep::UninstallCsrAgent => write!(f, "FailedToUninstallCsrAgent"),
            DeregistrationStep::GetRemoteClient => write!(f, "FailedToGetRemoteClient"),
            DeregistrationStep::CleanUpCertSecrets => write!(f, "FailedToCleanUpCertSecrets"),
            DeregistrationStep::CleanUpKubeConfigSecret => {
                write!(f, "FailedToCleanUpKubeConfigSecret")
            }
            DeregistrationStep::CleanUpKubeConfigCrd => write!(f, "FailedToCleanUpKubeConfigCrd"),
            DeregistrationStep::CleanUpServiceAccount => {
                write!(f, "FailedToCleanUpServiceAccount")
            }
            DeregistrationStep::RemoveCrds => write!(f, "FailedToRemoveCrds"),
        }
    }
}

/// Main error type for meshplane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The service account never got a token secret within the retry budget
    #[error("token secret for service account {namespace}/{service_account} not ready after {attempts} attempts")]
    SecretNotReady {
        /// Service account name
        service_account: String,
        /// Service account namespace
        namespace: String,
        /// Number of polling attempts made so far
        attempts: u32,
    },

    /// The token secret exists but does not carry the expected field
    #[error("secret {namespace}/{secret} is malformed: missing key '{key}'")]
    MalformedSecret {
        /// Secret name
        secret: String,
        /// Secret namespace
        namespace: String,
        /// The key that was expected
        key: String,
    },

    /// The service account references more than one secret
    #[error("service account {namespace}/{service_account} references {count} secrets, expected exactly one")]
    AmbiguousServiceAccountSecrets {
        /// Service account name
        service_account: String,
        /// Service account namespace
        namespace: String,
        /// Number of secrets referenced
        count: usize,
    },

    /// The requested context is absent from a kubeconfig
    #[error("context '{context}' not found in kubeconfig")]
    ContextNotFound {
        /// Context name that was looked up
        context: String,
    },

    /// The cluster referenced by a kubeconfig context is absent
    #[error("cluster '{cluster}' referenced by context '{context}' not found in kubeconfig")]
    KubeconfigClusterNotFound {
        /// Cluster entry name that was looked up
        cluster: String,
        /// Context that referenced it
        context: String,
    },

    /// A resource type is not served by the API server
    #[error("resource type {kind} is not installed")]
    ResourceTypeMissing {
        /// Kind (or CRD name) that is missing
        kind: String,
    },

    /// No cluster record exists under the given name
    #[error("cluster {cluster} is not registered")]
    ClusterNotRegistered {
        /// Name of the cluster
        cluster: String,
    },

    /// A cluster record already exists and overwrite was not requested
    #[error("cluster {cluster} is already registered; pass overwrite to replace it")]
    ClusterAlreadyRegistered {
        /// Name of the cluster
        cluster: String,
    },

    /// The cluster's kubeconfig secret is gone and no client for it is cached,
    /// so its remote identities cannot be reached
    #[error("no credentials remain for cluster {cluster}; remove its service accounts and agent CRDs by hand")]
    RemoteCredentialsUnavailable {
        /// Name of the cluster
        cluster: String,
    },

    /// The package manager reports the release is already present
    #[error("release {namespace}/{release} is already installed")]
    ReleaseAlreadyInstalled {
        /// Release name
        release: String,
        /// Release namespace
        namespace: String,
    },

    /// The package manager has no history for the release
    #[error("release {namespace}/{release} not found")]
    ReleaseNotFound {
        /// Release name
        release: String,
        /// Release namespace
        namespace: String,
    },

    /// Any other package manager failure
    #[error("package manager error for release {namespace}/{release}: {message}")]
    PackageManager {
        /// Release name
        release: String,
        /// Release namespace
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// A registration step failed
    #[error("{step} for cluster {cluster}: {source}")]
    Registration {
        /// Name of the cluster being registered
        cluster: String,
        /// Step that failed
        step: RegistrationStep,
        /// Underlying cause
        source: Box<Error>,
    },

    /// A deregistration step failed
    #[error("{step} for cluster {cluster}: {source}")]
    Deregistration {
        /// Name of the cluster being deregistered
        cluster: String,
        /// Step that failed
        step: DeregistrationStep,
        /// Underlying cause
        source: Box<Error>,
    },

    /// Deleting a CRD failed; earlier deletions may have succeeded
    #[error("failed to delete CRD {crd} on cluster {cluster}: {source}")]
    CrdDeletion {
        /// Cluster the CRD lives on
        cluster: String,
        /// CRD name
        crd: String,
        /// Whether any CRD was removed before the failure
        any_removed: bool,
        /// Underlying cause
        source: Box<Error>,
    },

    /// Kubeconfig could not be read, parsed or converted
    #[error("kubeconfig error: {message}")]
    Kubeconfig {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The operation was cancelled or its deadline passed
    #[error("operation {operation} cancelled")]
    Cancelled {
        /// Operation that was interrupted
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Wrap an error as the failure of a registration step
    pub fn registration(cluster: impl Into<String>, step: RegistrationStep, source: Error) -> Self {
        Self::Registration {
            cluster: cluster.into(),
            step,
            source: Box::new(source),
        }
    }

    /// Wrap an error as the failure of a deregistration step
    pub fn deregistration(
        cluster: impl Into<String>,
        step: DeregistrationStep,
        source: Error,
    ) -> Self {
        Self::Deregistration {
            cluster: cluster.into(),
            step,
            source: Box::new(source),
        }
    }

    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a package manager error for a release
    pub fn package_manager(
        release: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::PackageManager {
            release: release.into(),
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for an operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is worth retrying within a bounded poll
    ///
    /// Only transient conditions qualify: a token secret that has not
    /// appeared yet, or a Kubernetes error outside the 4xx range.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::SecretNotReady { .. } => true,
            _ => false,
        }
    }

    /// Check if this error means the target object does not exist
    ///
    /// Looks through step wrappers so callers can ask the question of any
    /// error returned by this crate.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Registration { source, .. }
            | Error::Deregistration { source, .. }
            | Error::CrdDeletion { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::ClusterNotRegistered { cluster }
            | Error::ClusterAlreadyRegistered { cluster }
            | Error::RemoteCredentialsUnavailable { cluster }
            | Error::Registration { cluster, .. }
            | Error::Deregistration { cluster, .. }
            | Error::CrdDeletion { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the failed deregistration step, if this is a deregistration error
    pub fn deregistration_step(&self) -> Option<DeregistrationStep> {
        match self {
            Error::Deregistration { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Get the failed registration step, if this is a registration error
    pub fn registration_step(&self) -> Option<RegistrationStep> {
        match self {
            Error::Registration { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Build a `kube::Error` carrying an API status with the given code
///
/// Used by fakes and by code that needs to synthesize API-level conditions.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    })
}
