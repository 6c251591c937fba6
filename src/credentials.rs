//! Service account bootstrap on a remote cluster
//!
//! Registration authenticates to the remote cluster with the caller's
//! administrative credentials exactly once: to create a dedicated service
//! account, bind it to the fixed role set, and read back the bearer token the
//! remote control plane issues for it. Everything afterwards uses that token.
//!
//! The token secret appears asynchronously, so reading it is a bounded poll.
//! A role binding failure leaves the service account behind; deregistration
//! removes it by label.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::remote::RemoteClusterApi;
use crate::retry::{cancellable, retry_with_backoff, RetryConfig};
use crate::{Error, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Key of the bearer token in a service account token secret
pub const TOKEN_KEY: &str = "token";

/// Name and namespace of the service account to bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePrincipalRef {
    /// Service account name
    pub name: String,
    /// Service account namespace
    pub namespace: String,
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

/// Name of the binding between a service account and a cluster role
///
/// Deterministic so that binding the same role twice updates one object.
pub fn cluster_role_binding_name(service_account: &str, role: &str) -> String {
    format!("{}-{}-clusterrole-binding", service_account, role)
}

/// The labelled service account object
pub fn service_account(principal: &ServicePrincipalRef) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(principal.name.clone()),
            namespace: Some(principal.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// The labelled binding granting `role` to the service account
pub fn cluster_role_binding(principal: &ServicePrincipalRef, role: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(cluster_role_binding_name(&principal.name, role)),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: principal.name.clone(),
            namespace: Some(principal.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Extract the bearer token from a token secret
pub fn token_from_secret(secret: &Secret) -> Result<String> {
    let malformed = || Error::MalformedSecret {
        secret: secret.name_any(),
        namespace: secret.namespace().unwrap_or_default(),
        key: TOKEN_KEY.to_string(),
    };
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(TOKEN_KEY))
        .ok_or_else(malformed)?;
    String::from_utf8(bytes.0.clone()).map_err(|_| malformed())
}

/// One poll of the service account's token
///
/// Zero referenced secrets (or a referenced secret that does not exist yet) is
/// [`Error::SecretNotReady`]; more than one is ambiguous and final.
async fn fetch_token(
    api: &dyn RemoteClusterApi,
    principal: &ServicePrincipalRef,
    attempt: u32,
) -> Result<String> {
    let not_ready = || Error::SecretNotReady {
        service_account: principal.name.clone(),
        namespace: principal.namespace.clone(),
        attempts: attempt,
    };

    let sa = api
        .get_service_account(&principal.namespace, &principal.name)
        .await?;
    let refs = sa.secrets.unwrap_or_default();
    let secret_name = match refs.as_slice() {
        [] => return Err(not_ready()),
        [only] => only.name.clone().ok_or_else(not_ready)?,
        many => {
            return Err(Error::AmbiguousServiceAccountSecrets {
                service_account: principal.name.clone(),
                namespace: principal.namespace.clone(),
                count: many.len(),
            })
        }
    };

    let secret = match api.get_secret(&principal.namespace, &secret_name).await {
        Ok(secret) => secret,
        Err(e) if e.is_not_found() => return Err(not_ready()),
        Err(e) => return Err(e),
    };
    token_from_secret(&secret)
}

/// Create the write namespace and service account, bind its roles, and wait for its token
///
/// Returns the bearer token. The service account and bindings are applied,
/// so calling this again with the same arguments converges on the same
/// objects.
#[instrument(skip(api, roles, poll, cancel), fields(service_account = %principal.name, namespace = %principal.namespace))]
pub async fn bootstrap(
    api: &dyn RemoteClusterApi,
    principal: &ServicePrincipalRef,
    roles: &[String],
    poll: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<String> {
    cancellable(
        cancel,
        "apply_namespace",
        api.apply_namespace(&principal.namespace),
    )
    .await?;

    cancellable(
        cancel,
        "apply_service_account",
        api.apply_service_account(&service_account(principal)),
    )
    .await?;
    debug!("Service account applied");

    for role in roles {
        cancellable(
            cancel,
            "apply_cluster_role_binding",
            api.apply_cluster_role_binding(&cluster_role_binding(principal, role)),
        )
        .await?;
        debug!(role = %role, "Cluster role bound");
    }

    let mut attempt = 0u32;
    let polled = retry_with_backoff(poll, "wait_for_service_account_token", cancel, || {
        attempt += 1;
        fetch_token(api, principal, attempt)
    })
    .await;

    // A budget that ran out on transient API errors is still a token that never arrived
    let token = polled.map_err(|e| match e {
        Error::Kube { .. } if e.is_retryable() => {
            warn!(attempts = attempt, error = %e, "Token poll exhausted on API errors");
            Error::SecretNotReady {
                service_account: principal.name.clone(),
                namespace: principal.namespace.clone(),
                attempts: attempt,
            }
        }
        other => other,
    })?;

    info!("Service account token obtained");
    Ok(token)
}
