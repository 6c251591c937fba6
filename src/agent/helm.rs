//! Package manager client backed by the `helm` binary
//!
//! Each call writes the connection's kubeconfig to a private temporary file
//! and points helm at it, so the process never inherits the operator's own
//! kubeconfig.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ChartSource, InstallRequest, PackageManager};
use crate::kubeconfig::ClusterConnection;
use crate::{Error, Result};

const ALREADY_INSTALLED: &str = "cannot re-use a name that is still in use";
const RELEASE_NOT_FOUND: &str = "not found";

/// [`PackageManager`] that shells out to helm
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: PathBuf,
}

impl HelmCli {
    /// Use the helm binary at `binary` (a bare name is looked up on PATH)
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(
        &self,
        connection: &ClusterConnection,
        release: &str,
        namespace: &str,
        args: Vec<OsString>,
    ) -> Result<()> {
        let kubeconfig = write_kubeconfig(connection)
            .map_err(|e| Error::package_manager(release, namespace, e))?;

        let mut full_args = args;
        full_args.extend(connection_args(kubeconfig.path(), connection.context()));
        debug!(release = %release, namespace = %namespace, args = ?full_args, "Running helm");

        // Cancelling the caller drops this future; helm must not outlive it
        let output = Command::new(&self.binary)
            .args(&full_args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::package_manager(release, namespace, format!("failed to run helm: {}", e))
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(&stderr, release, namespace))
    }
}

fn write_kubeconfig(connection: &ClusterConnection) -> std::result::Result<tempfile::NamedTempFile, String> {
    let yaml = connection
        .to_yaml()
        .map_err(|e| format!("failed to serialize kubeconfig: {}", e))?;
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|e| format!("failed to create kubeconfig file: {}", e))?;
    file.write_all(yaml.as_bytes())
        .map_err(|e| format!("failed to write kubeconfig file: {}", e))?;
    Ok(file)
}

fn connection_args(kubeconfig: &Path, context: &str) -> Vec<OsString> {
    vec![
        "--kubeconfig".into(),
        kubeconfig.as_os_str().to_owned(),
        "--kube-context".into(),
        context.into(),
    ]
}

/// Arguments for `helm install`, minus connection flags
pub fn install_args(request: &InstallRequest) -> Vec<OsString> {
    let chart: OsString = match &request.chart {
        ChartSource::Remote(uri) => uri.into(),
        ChartSource::Local(path) => path.as_os_str().to_owned(),
    };
    let mut args: Vec<OsString> = vec![
        "install".into(),
        request.release.as_str().into(),
        chart,
        "--namespace".into(),
        request.namespace.as_str().into(),
    ];
    if request.create_namespace {
        args.push("--create-namespace".into());
    }
    for (key, value) in &request.values {
        args.push("--set".into());
        args.push(format!("{}={}", key, value).into());
    }
    args
}

/// Arguments for `helm uninstall`, minus connection flags
pub fn uninstall_args(namespace: &str, release: &str) -> Vec<OsString> {
    vec![
        "uninstall".into(),
        release.into(),
        "--namespace".into(),
        namespace.into(),
    ]
}

/// Map helm's stderr onto the conditions callers distinguish
pub fn classify_failure(stderr: &str, release: &str, namespace: &str) -> Error {
    if stderr.contains(ALREADY_INSTALLED) {
        Error::ReleaseAlreadyInstalled {
            release: release.to_string(),
            namespace: namespace.to_string(),
        }
    } else if stderr.contains(RELEASE_NOT_FOUND) && stderr.contains(release) {
        Error::ReleaseNotFound {
            release: release.to_string(),
            namespace: namespace.to_string(),
        }
    } else {
        Error::package_manager(release, namespace, stderr.trim())
    }
}

#[async_trait]
impl PackageManager for HelmCli {
    async fn install(&self, connection: &ClusterConnection, request: &InstallRequest) -> Result<()> {
        self.run(
            connection,
            &request.release,
            &request.namespace,
            install_args(request),
        )
        .await
    }

    async fn uninstall(
        &self,
        connection: &ClusterConnection,
        namespace: &str,
        release: &str,
    ) -> Result<()> {
        self.run(connection, release, namespace, uninstall_args(namespace, release))
            .await
    }
}
