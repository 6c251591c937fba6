//! meshplane - register and deregister remote clusters with the management plane

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshplane::agent::HelmCli;
use meshplane::config::MeshplaneConfig;
use meshplane::crd::KubernetesCluster;
use meshplane::kubeconfig::ClusterConnection;
use meshplane::lifecycle::{ClusterLifecycle, RegistrationOptions, RegistrationRequest};
use meshplane::registry::{ClusterRegistry, KubeClusterRegistry};
use meshplane::remote::KubeClientCache;
use meshplane::MANUAL_DISCOVERY_SOURCE;

/// meshplane - cross-cluster trust bootstrap for the mesh management plane
#[derive(Parser, Debug)]
#[command(name = "meshplane", version, about, long_about = None)]
struct Cli {
    /// Print the KubernetesCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a meshplane configuration file
    #[arg(long, env = "MESHPLANE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Abort the operation after this many seconds
    #[arg(long, default_value = "600", global = true)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a remote cluster
    ///
    /// Creates a service account on the remote cluster, installs the
    /// certificate agent with its token and records the cluster on the
    /// management cluster. The supplied kubeconfig is only used for the
    /// bootstrap and is never persisted.
    Register(RegisterArgs),

    /// Deregister a remote cluster and remove everything meshplane put on it
    Deregister(DeregisterArgs),

    /// List registered clusters
    Clusters,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    /// Name to register the cluster under
    #[arg(long)]
    cluster_name: String,

    /// Kubeconfig with admin access to the remote cluster
    #[arg(long, env = "REMOTE_KUBECONFIG")]
    remote_kubeconfig: PathBuf,

    /// Context in the remote kubeconfig; the current context when omitted
    #[arg(long)]
    remote_context: Option<String>,

    /// Namespace on the remote cluster meshplane writes to
    #[arg(long, default_value = meshplane::DEFAULT_MANAGEMENT_NAMESPACE)]
    write_namespace: String,

    /// Value recorded in the discovered-by label
    #[arg(long, default_value = MANUAL_DISCOVERY_SOURCE)]
    discovery_source: String,

    /// Replace an existing registration with the same name
    #[arg(long)]
    overwrite: bool,

    /// Install the locally packaged agent chart
    #[arg(long)]
    dev_package: bool,

    /// Cluster DNS domain, when it is not cluster.local
    #[arg(long)]
    cluster_domain: Option<String>,
}

#[derive(Args, Debug)]
struct DeregisterArgs {
    /// Name the cluster was registered under
    #[arg(long)]
    cluster_name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&KubernetesCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let Some(command) = cli.command else {
        anyhow::bail!("no command given; see --help");
    };

    let config = MeshplaneConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to management cluster: {}", e))?;
    let registry: Arc<dyn ClusterRegistry> = Arc::new(KubeClusterRegistry::new(
        client,
        config.management_namespace.clone(),
    ));

    let cancel = CancellationToken::new();
    let deadline = Duration::from_secs(cli.timeout_secs);
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        tracing::warn!(timeout_secs = deadline.as_secs(), "Deadline reached, cancelling");
        timer.cancel();
    });

    match command {
        Commands::Clusters => list_clusters(registry.as_ref()).await,
        Commands::Register(args) => {
            let lifecycle = lifecycle(registry, config);
            run_register(&lifecycle, &cancel, args).await
        }
        Commands::Deregister(args) => {
            let lifecycle = lifecycle(registry, config);
            lifecycle
                .deregister_by_name(&cancel, &args.cluster_name)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("Cluster {} deregistered", args.cluster_name);
            Ok(())
        }
    }
}

fn lifecycle(registry: Arc<dyn ClusterRegistry>, config: MeshplaneConfig) -> ClusterLifecycle {
    let clients = Arc::new(KubeClientCache::new(registry.clone()));
    let helm = Arc::new(HelmCli::new(config.helm_binary.clone()));
    ClusterLifecycle::new(registry, clients, helm, config)
}

/// Load the remote kubeconfig, bound to `context` when one is given
fn remote_connection(path: &Path, context: Option<&str>) -> anyhow::Result<ClusterConnection> {
    ClusterConnection::from_path(path, context)
        .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {:?}: {}", path, e))
}

async fn run_register(
    lifecycle: &ClusterLifecycle,
    cancel: &CancellationToken,
    args: RegisterArgs,
) -> anyhow::Result<()> {
    let connection = remote_connection(&args.remote_kubeconfig, args.remote_context.as_deref())?;

    let request = RegistrationRequest {
        cluster_name: args.cluster_name,
        write_namespace: args.write_namespace,
        context: None,
        discovery_source: args.discovery_source,
        options: RegistrationOptions {
            overwrite: args.overwrite,
            use_dev_package: args.dev_package,
            cluster_domain: args.cluster_domain,
        },
    };

    let record = lifecycle
        .register(cancel, &connection, &request)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    println!(
        "Cluster {} registered (server {}, write namespace {})",
        record.name_any(),
        connection.server(),
        record.spec.write_namespace
    );
    Ok(())
}

async fn list_clusters(registry: &dyn ClusterRegistry) -> anyhow::Result<()> {
    let installed = registry
        .record_type_installed()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to check for KubernetesCluster CRD: {}", e))?;
    if !installed {
        println!("No clusters registered");
        return Ok(());
    }

    let records = registry
        .list()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list clusters: {}", e))?;
    if records.is_empty() {
        println!("No clusters registered");
        return Ok(());
    }
    for record in records {
        println!(
            "{}\twrite-namespace={}\tdiscovered-by={}",
            record.name_any(),
            record.spec.write_namespace,
            record.discovered_by().unwrap_or("-")
        );
    }
    Ok(())
}
