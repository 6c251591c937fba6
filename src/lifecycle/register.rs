//! Cluster registration

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::ClusterLifecycle;
use crate::credentials::{self, ServicePrincipalRef};
use crate::crd::{KubernetesCluster, KubernetesClusterSpec, SecretRef};
use crate::error::RegistrationStep;
use crate::kubeconfig::ClusterConnection;
use crate::retry::cancellable;
use crate::{Error, Result, CLUSTER_ADMIN_ROLE};

/// Optional behaviour for a registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationOptions {
    /// Replace an existing registration under the same name
    pub overwrite: bool,
    /// Install the locally packaged agent chart instead of the published one
    pub use_dev_package: bool,
    /// Cluster DNS domain to record, when it is not `cluster.local`
    pub cluster_domain: Option<String>,
}

/// What to register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    /// Name the cluster is registered under
    pub cluster_name: String,
    /// Namespace on the remote cluster meshplane writes to
    pub write_namespace: String,
    /// Context of the supplied connection to use; the bound context when `None`
    pub context: Option<String>,
    /// Value of the discovered-by label on the record
    pub discovery_source: String,
    /// Optional behaviour
    pub options: RegistrationOptions,
}

impl ClusterLifecycle {
    /// Register a remote cluster
    ///
    /// Creates a labelled service account in the write namespace, binds it to
    /// `cluster-admin`, waits for its token, installs the agent using only
    /// that token, then persists the sanitized kubeconfig and the cluster
    /// record. Returns the record that was written.
    ///
    /// Without `overwrite`, an existing record under the same name fails the
    /// call before the remote cluster is contacted.
    #[instrument(skip(self, cancel, connection, request), fields(cluster = %request.cluster_name, write_namespace = %request.write_namespace))]
    pub async fn register(
        &self,
        cancel: &CancellationToken,
        connection: &ClusterConnection,
        request: &RegistrationRequest,
    ) -> Result<KubernetesCluster> {
        let cluster = request.cluster_name.as_str();
        let step = move |step: RegistrationStep| move |e: Error| Error::registration(cluster, step, e);

        // Check for an existing registration
        self.check_existing(cancel, request)
            .await
            .map_err(step(RegistrationStep::CheckExisting))?;

        // Connect with the caller's credentials
        let connection = match &request.context {
            Some(context) => connection
                .with_context(context)
                .map_err(step(RegistrationStep::ConnectRemote))?,
            None => connection.clone(),
        };
        let remote = cancellable(cancel, "connect_remote", self.clients.for_connection(&connection))
            .await
            .map_err(step(RegistrationStep::ConnectRemote))?;

        // Service account, role bindings and token
        let principal = ServicePrincipalRef {
            name: request.cluster_name.clone(),
            namespace: request.write_namespace.clone(),
        };
        let token = credentials::bootstrap(
            remote.as_ref(),
            &principal,
            &[CLUSTER_ADMIN_ROLE.to_string()],
            &self.config.token_poll.retry_config(),
            cancel,
        )
        .await
        .map_err(step(RegistrationStep::BootstrapCredentials))?;

        // Drop the caller's credentials
        let sanitized = connection
            .sanitize(&token)
            .map_err(step(RegistrationStep::SanitizeConnection))?;

        // Agent, installed as the service account
        let package = self.agent.package(request.options.use_dev_package);
        cancellable(
            cancel,
            "install_agent",
            self.agent.install(
                &sanitized,
                &request.write_namespace,
                self.agent.release_name(),
                package,
                true,
            ),
        )
        .await
        .map_err(step(RegistrationStep::InstallAgent))?;

        // Kubeconfig secret, then the record referencing it
        let record = self.build_record(request);
        let persisted = sanitized
            .to_persisted(sanitized.context(), cluster)
            .map_err(step(RegistrationStep::PersistRecord))?;
        cancellable(cancel, "persist_record", self.registry.upsert(&record, &persisted))
            .await
            .map_err(step(RegistrationStep::PersistRecord))?;

        self.clients.evict(cluster);
        info!(
            discovered_by = %request.discovery_source,
            record = %record.name_any(),
            "Cluster registered"
        );
        Ok(record)
    }

    async fn check_existing(
        &self,
        cancel: &CancellationToken,
        request: &RegistrationRequest,
    ) -> Result<()> {
        cancellable(cancel, "ensure_record_type", self.registry.ensure_record_type()).await?;
        if request.options.overwrite {
            return Ok(());
        }
        let existing = cancellable(cancel, "get_record", self.registry.get(&request.cluster_name))
            .await?;
        match existing {
            Some(_) => Err(Error::ClusterAlreadyRegistered {
                cluster: request.cluster_name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn build_record(&self, request: &RegistrationRequest) -> KubernetesCluster {
        let namespace = &self.config.management_namespace;
        KubernetesCluster::record(
            &request.cluster_name,
            namespace,
            &request.discovery_source,
            KubernetesClusterSpec {
                secret_ref: SecretRef {
                    name: request.cluster_name.clone(),
                    namespace: namespace.clone(),
                },
                write_namespace: request.write_namespace.clone(),
                cluster_domain: request.options.cluster_domain.clone(),
            },
        )
    }
}
