//! Cluster deregistration
//!
//! Teardown runs in a fixed order: resolve the persisted connection, remove
//! the agent, purge the agent's certificate secrets, delete the kubeconfig
//! secret and the record on the management cluster, sweep the service
//! accounts and role bindings by label, then remove the agent's CRDs. Each
//! step tolerates state a previous or concurrent run already removed. A run
//! that finds the record but not its kubeconfig secret picks up at the record
//! delete, using the client cached by the run that removed the secret.

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::ClusterLifecycle;
use crate::crd::KubernetesCluster;
use crate::crd_lifecycle::remove_crds_by_group;
use crate::error::DeregistrationStep;
use crate::registry::resolve;
use crate::remote::RemoteClusterApi;
use crate::retry::cancellable;
use crate::{managed_by_selector, Error, Result, CERT_SECRET_TYPE};

impl ClusterLifecycle {
    /// Deregister a cluster by name
    ///
    /// A cluster with no record, or a management cluster without the record
    /// type, is already deregistered.
    pub async fn deregister_by_name(&self, cancel: &CancellationToken, cluster: &str) -> Result<()> {
        let find = |e: Error| {
            Error::deregistration(cluster, DeregistrationStep::FindClusterCredentials, e)
        };

        if !cancellable(cancel, "record_type_installed", self.registry.record_type_installed())
            .await
            .map_err(find)?
        {
            debug!(cluster = %cluster, "Record type not installed, nothing to deregister");
            return Ok(());
        }
        match cancellable(cancel, "get_record", self.registry.get(cluster))
            .await
            .map_err(find)?
        {
            Some(record) => self.deregister(cancel, &record).await,
            None => {
                debug!(cluster = %cluster, "Cluster not registered, nothing to deregister");
                Ok(())
            }
        }
    }

    /// Deregister a cluster
    ///
    /// Returns the first failing step as [`Error::Deregistration`]; steps that
    /// completed before it stay completed. Calling this again after a failure
    /// resumes the teardown.
    #[instrument(skip(self, cancel, record), fields(cluster = %record.name_any()))]
    pub async fn deregister(&self, cancel: &CancellationToken, record: &KubernetesCluster) -> Result<()> {
        let cluster = record.name_any();
        let cluster = cluster.as_str();
        let write_namespace = record.spec.write_namespace.as_str();
        let step = move |step: DeregistrationStep| move |e: Error| Error::deregistration(cluster, step, e);

        // 1. Resolve the persisted connection
        let resolved = match cancellable(cancel, "resolve", resolve(self.registry.as_ref(), cluster)).await {
            Ok(resolved) => resolved,
            Err(Error::ResourceTypeMissing { .. }) | Err(Error::ClusterNotRegistered { .. }) => {
                info!("Cluster already deregistered");
                return Ok(());
            }
            // The kubeconfig secret goes at step 5, so everything up to it is done
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "Kubeconfig secret already removed, resuming after it");
                return self.resume_without_credentials(cancel, record).await;
            }
            Err(e) => return Err(step(DeregistrationStep::FindClusterCredentials)(e)),
        };

        // 2. Agent first; it may own objects removed below
        cancellable(
            cancel,
            "uninstall_agent",
            self.agent.uninstall(
                &resolved.connection,
                write_namespace,
                self.agent.release_name(),
            ),
        )
        .await
        .map_err(step(DeregistrationStep::UninstallCsrAgent))?;

        // 3. Remote client, from the connection resolved above
        let remote = cancellable(
            cancel,
            "get_remote_client",
            self.clients.for_resolved(cluster, &resolved.connection),
        )
        .await
        .map_err(step(DeregistrationStep::GetRemoteClient))?;

        // 4. Certificate secrets the agent wrote
        purge_cert_secrets(remote.as_ref(), write_namespace, cancel)
            .await
            .map_err(step(DeregistrationStep::CleanUpCertSecrets))?;

        // 5. Kubeconfig secret, by the record's reference
        cancellable(
            cancel,
            "delete_kubeconfig_secret",
            self.registry.delete_kubeconfig_secret(&record.spec.secret_ref),
        )
        .await
        .map_err(step(DeregistrationStep::CleanUpKubeConfigSecret))?;

        // 6. The record itself
        cancellable(cancel, "delete_record", self.registry.delete(cluster))
            .await
            .map_err(step(DeregistrationStep::CleanUpKubeConfigCrd))?;

        self.sweep_remote(cancel, remote.as_ref(), cluster, write_namespace)
            .await
    }

    /// Finish a teardown whose kubeconfig secret is already gone
    ///
    /// Deletes the record, then sweeps the remote cluster through the client
    /// cached by the earlier run. Without one the remote identities cannot be
    /// reached, which is reported as a service account cleanup failure; the
    /// record is gone by then, so the next run finds nothing to do.
    async fn resume_without_credentials(
        &self,
        cancel: &CancellationToken,
        record: &KubernetesCluster,
    ) -> Result<()> {
        let cluster = record.name_any();
        let cluster = cluster.as_str();

        cancellable(cancel, "delete_record", self.registry.delete(cluster))
            .await
            .map_err(|e| {
                Error::deregistration(cluster, DeregistrationStep::CleanUpKubeConfigCrd, e)
            })?;

        let Some(remote) = self.clients.cached(cluster) else {
            return Err(Error::deregistration(
                cluster,
                DeregistrationStep::CleanUpServiceAccount,
                Error::RemoteCredentialsUnavailable {
                    cluster: cluster.to_string(),
                },
            ));
        };
        self.sweep_remote(cancel, remote.as_ref(), cluster, &record.spec.write_namespace)
            .await
    }

    /// Steps 7 and 8, then drop the cached client
    async fn sweep_remote(
        &self,
        cancel: &CancellationToken,
        remote: &dyn RemoteClusterApi,
        cluster: &str,
        write_namespace: &str,
    ) -> Result<()> {
        let step = move |step: DeregistrationStep| move |e: Error| Error::deregistration(cluster, step, e);

        // 7. Service accounts and their bindings, by label
        purge_service_accounts(remote, write_namespace, cancel)
            .await
            .map_err(step(DeregistrationStep::CleanUpServiceAccount))?;

        // 8. Agent CRDs, scoped to the agent's group
        let removed = remove_crds_by_group(remote, cluster, self.agent.crd_group(), cancel)
            .await
            .map_err(step(DeregistrationStep::RemoveCrds))?;

        self.clients.evict(cluster);
        info!(crds_removed = removed, "Cluster deregistered");
        Ok(())
    }
}

/// Delete every certificate secret in the write namespace
async fn purge_cert_secrets(
    remote: &dyn RemoteClusterApi,
    namespace: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let secrets = cancellable(cancel, "list_secrets", remote.list_secrets(namespace)).await?;
    for secret in secrets
        .iter()
        .filter(|s| s.type_.as_deref() == Some(CERT_SECRET_TYPE))
    {
        let name = secret.name_any();
        match cancellable(cancel, "delete_secret", remote.delete_secret(namespace, &name)).await {
            Ok(()) => debug!(namespace = %namespace, secret = %name, "Deleted certificate secret"),
            Err(e) if e.is_not_found() => {
                debug!(namespace = %namespace, secret = %name, "Certificate secret already deleted")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Delete the labelled service accounts and cluster role bindings
async fn purge_service_accounts(
    remote: &dyn RemoteClusterApi,
    namespace: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let selector = managed_by_selector();
    let accounts = cancellable(
        cancel,
        "delete_service_accounts",
        remote.delete_service_accounts(namespace, &selector),
    )
    .await?;
    let bindings = cancellable(
        cancel,
        "delete_cluster_role_bindings",
        remote.delete_cluster_role_bindings(&selector),
    )
    .await?;
    debug!(
        namespace = %namespace,
        service_accounts = accounts,
        bindings = bindings,
        "Swept managed identities"
    );
    Ok(())
}
