//! In-memory fakes for exercising the protocols end to end
//!
//! [`FakeCluster`] stands in for a remote API server (including the token
//! controller that issues service account secrets), [`FakeRegistry`] for the
//! management cluster, [`FakePackageManager`] for helm and the agent it
//! installs, and [`FakeClientProvider`] for the client cache.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use crate::agent::{InstallRequest, PackageManager};
use crate::crd::{KubernetesCluster, SecretRef};
use crate::error::api_error;
use crate::kubeconfig::ClusterConnection;
use crate::registry::{decode_kubeconfig, kubeconfig_secret, resolve, ClusterRegistry};
use crate::remote::{ClientProvider, RemoteClusterApi};
use crate::{Error, Result, AGENT_CRD_GROUP, CERT_SECRET_TYPE};

pub const REMOTE_SERVER: &str = "https://remote-1:6443";

/// Kubeconfig the installer uses: client certificate plus an unrelated token
pub const ADMIN_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: kind-remote-1
clusters:
  - name: kind-remote-1
    cluster:
      server: https://remote-1:6443
      certificate-authority-data: Q0E=
users:
  - name: kind-remote-1
    user:
      client-certificate-data: Q0VSVA==
      client-key-data: S0VZ
      token: installer-token
contexts:
  - name: kind-remote-1
    context:
      cluster: kind-remote-1
      user: kind-remote-1
"#;

pub fn admin_connection() -> ClusterConnection {
    ClusterConnection::from_yaml(ADMIN_KUBECONFIG, None).unwrap()
}

fn not_found(what: &str, name: &str) -> Error {
    api_error(404, "NotFound", format!("{} \"{}\" not found", what, name)).into()
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    match selector.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => labels.contains_key(selector),
    }
}

fn crd(name: &str, group: &str) -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: group.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    namespaces: BTreeSet<String>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    secrets: BTreeMap<Key, Secret>,
    bindings: BTreeMap<String, ClusterRoleBinding>,
    crds: BTreeMap<String, CustomResourceDefinition>,
    failing_crd_deletes: BTreeSet<String>,
    failing_secret_deletes: BTreeSet<String>,
}

/// In-memory remote API server
pub struct FakeCluster {
    server: String,
    issue_tokens: AtomicBool,
    calls: AtomicUsize,
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            issue_tokens: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            state: Mutex::new(ClusterState::default()),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Stop the token controller from issuing service account secrets
    pub fn withhold_tokens(&self) {
        self.issue_tokens.store(false, Ordering::SeqCst);
    }

    /// Number of API calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn add_crd(&self, name: &str, group: &str) {
        self.state
            .lock()
            .unwrap()
            .crds
            .insert(name.to_string(), crd(name, group));
    }

    pub fn add_secret(&self, namespace: &str, name: &str, type_: &str) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            ..Default::default()
        };
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(key(namespace, name), secret);
    }

    pub fn fail_crd_delete(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_crd_deletes
            .insert(name.to_string());
    }

    pub fn fail_secret_delete(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_secret_deletes
            .insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_crd_deletes.clear();
        state.failing_secret_deletes.clear();
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().unwrap().namespaces.iter().cloned().collect()
    }

    pub fn service_account_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn cluster_role_binding_names(&self) -> Vec<String> {
        self.state.lock().unwrap().bindings.keys().cloned().collect()
    }

    pub fn crd_names(&self) -> Vec<String> {
        self.state.lock().unwrap().crds.keys().cloned().collect()
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteClusterApi for FakeCluster {
    async fn apply_namespace(&self, name: &str) -> Result<()> {
        self.touch();
        self.state.lock().unwrap().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn apply_service_account(&self, service_account: &ServiceAccount) -> Result<()> {
        self.touch();
        let namespace = service_account.namespace().unwrap_or_default();
        let name = service_account.name_any();
        let mut state = self.state.lock().unwrap();

        let mut applied = service_account.clone();
        if let Some(existing) = state.service_accounts.get(&key(&namespace, &name)) {
            applied.secrets = existing.secrets.clone();
        }

        if applied.secrets.is_none() && self.issue_tokens.load(Ordering::SeqCst) {
            let secret_name = format!("{}-token", name);
            let token = format!("token-for-{}-{}", namespace, name);
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(secret_name.clone()),
                    namespace: Some(namespace.clone()),
                    ..Default::default()
                },
                type_: Some("kubernetes.io/service-account-token".to_string()),
                data: Some(BTreeMap::from([(
                    "token".to_string(),
                    ByteString(token.into_bytes()),
                )])),
                ..Default::default()
            };
            state.secrets.insert(key(&namespace, &secret_name), secret);
            applied.secrets = Some(vec![ObjectReference {
                name: Some(secret_name),
                ..Default::default()
            }]);
        }

        state.service_accounts.insert(key(&namespace, &name), applied);
        Ok(())
    }

    async fn apply_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        self.touch();
        self.state
            .lock()
            .unwrap()
            .bindings
            .insert(binding.name_any(), binding.clone());
        Ok(())
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
        self.touch();
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("serviceaccounts", name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.touch();
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("secrets", name))
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>> {
        self.touch();
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.touch();
        let mut state = self.state.lock().unwrap();
        if state.failing_secret_deletes.contains(name) {
            return Err(api_error(403, "Forbidden", "secret delete denied").into());
        }
        state
            .secrets
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found("secrets", name))
    }

    async fn delete_service_accounts(&self, namespace: &str, selector: &str) -> Result<usize> {
        self.touch();
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<Key> = state
            .service_accounts
            .iter()
            .filter(|((ns, _), sa)| ns == namespace && matches_selector(sa.labels(), selector))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            // The token controller removes a deleted account's token secrets.
            if let Some(sa) = state.service_accounts.remove(k) {
                for r in sa.secrets.unwrap_or_default() {
                    if let Some(secret) = r.name {
                        state.secrets.remove(&key(namespace, &secret));
                    }
                }
            }
        }
        Ok(doomed.len())
    }

    async fn delete_cluster_role_bindings(&self, selector: &str) -> Result<usize> {
        self.touch();
        let mut state = self.state.lock().unwrap();
        let before = state.bindings.len();
        state
            .bindings
            .retain(|_, b| !matches_selector(b.labels(), selector));
        Ok(before - state.bindings.len())
    }

    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>> {
        self.touch();
        Ok(self.state.lock().unwrap().crds.values().cloned().collect())
    }

    async fn delete_crd(&self, name: &str) -> Result<()> {
        self.touch();
        let mut state = self.state.lock().unwrap();
        if state.failing_crd_deletes.contains(name) {
            return Err(api_error(500, "InternalError", "crd delete failed").into());
        }
        state
            .crds
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("customresourcedefinitions", name))
    }
}

#[derive(Default)]
struct RegistryState {
    installed: bool,
    records: BTreeMap<String, KubernetesCluster>,
    secrets: BTreeMap<Key, Secret>,
    fail_record_delete: bool,
}

/// In-memory management cluster registry
#[derive(Default)]
pub struct FakeRegistry {
    calls: AtomicUsize,
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    /// Registry whose record type is already installed
    pub fn installed() -> Self {
        let registry = Self::default();
        registry.state.lock().unwrap().installed = true;
        registry
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn uninstall_record_type(&self) {
        let mut state = self.state.lock().unwrap();
        state.installed = false;
        state.records.clear();
    }

    pub fn fail_record_delete(&self, fail: bool) {
        self.state.lock().unwrap().fail_record_delete = fail;
    }

    /// Remove a record and its kubeconfig secret, as a concurrent teardown would
    pub fn remove_cluster(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.remove(name) {
            let secret_ref = &record.spec.secret_ref;
            state
                .secrets
                .remove(&key(&secret_ref.namespace, &secret_ref.name));
        }
    }

    pub fn record(&self, name: &str) -> Option<KubernetesCluster> {
        self.state.lock().unwrap().records.get(name).cloned()
    }

    pub fn kubeconfig(&self, secret_ref: &SecretRef, cluster: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let secret = state.secrets.get(&key(&secret_ref.namespace, &secret_ref.name))?;
        decode_kubeconfig(secret, cluster).ok()
    }

    pub fn secret_count(&self) -> usize {
        self.state.lock().unwrap().secrets.len()
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn require_installed(&self) -> Result<()> {
        if self.state.lock().unwrap().installed {
            Ok(())
        } else {
            Err(not_found("resource type", KubernetesCluster::CRD_NAME))
        }
    }
}

#[async_trait]
impl ClusterRegistry for FakeRegistry {
    async fn ensure_record_type(&self) -> Result<()> {
        self.touch();
        self.state.lock().unwrap().installed = true;
        Ok(())
    }

    async fn record_type_installed(&self) -> Result<bool> {
        self.touch();
        Ok(self.state.lock().unwrap().installed)
    }

    async fn get(&self, name: &str) -> Result<Option<KubernetesCluster>> {
        self.touch();
        self.require_installed()?;
        Ok(self.state.lock().unwrap().records.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<KubernetesCluster>> {
        self.touch();
        self.require_installed()?;
        Ok(self.state.lock().unwrap().records.values().cloned().collect())
    }

    async fn upsert(&self, record: &KubernetesCluster, kubeconfig: &str) -> Result<()> {
        self.touch();
        self.require_installed()?;
        let name = record.name_any();
        let secret_ref = &record.spec.secret_ref;
        let mut state = self.state.lock().unwrap();
        state.secrets.insert(
            key(&secret_ref.namespace, &secret_ref.name),
            kubeconfig_secret(&name, secret_ref, kubeconfig),
        );
        state.records.insert(name, record.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.touch();
        let mut state = self.state.lock().unwrap();
        if state.fail_record_delete {
            return Err(api_error(500, "InternalError", "record delete failed").into());
        }
        state.records.remove(name);
        Ok(())
    }

    async fn get_kubeconfig_secret(&self, secret_ref: &SecretRef) -> Result<Secret> {
        self.touch();
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&key(&secret_ref.namespace, &secret_ref.name))
            .cloned()
            .ok_or_else(|| not_found("secrets", &secret_ref.name))
    }

    async fn delete_kubeconfig_secret(&self, secret_ref: &SecretRef) -> Result<()> {
        self.touch();
        self.state
            .lock()
            .unwrap()
            .secrets
            .remove(&key(&secret_ref.namespace, &secret_ref.name));
        Ok(())
    }
}

/// Fake helm; installing the agent also creates the CRDs and certificate
/// secret the real agent would
#[derive(Default)]
pub struct FakePackageManager {
    clusters: BTreeMap<String, Arc<FakeCluster>>,
    releases: Mutex<BTreeSet<(String, String, String)>>,
    install_tokens: Mutex<Vec<Option<String>>>,
    fail_install: AtomicBool,
    calls: AtomicUsize,
}

impl FakePackageManager {
    pub fn new(clusters: &[Arc<FakeCluster>]) -> Self {
        Self {
            clusters: clusters
                .iter()
                .map(|c| (c.server().to_string(), c.clone()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_install(&self, fail: bool) {
        self.fail_install.store(fail, Ordering::SeqCst);
    }

    pub fn is_installed(&self, server: &str, namespace: &str, release: &str) -> bool {
        self.releases.lock().unwrap().contains(&(
            server.to_string(),
            namespace.to_string(),
            release.to_string(),
        ))
    }

    /// Bearer tokens of the connections installs were made with
    pub fn install_tokens(&self) -> Vec<Option<String>> {
        self.install_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageManager for FakePackageManager {
    async fn install(&self, connection: &ClusterConnection, request: &InstallRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let token = connection
            .raw()
            .users
            .first()
            .and_then(|u| u.user.token.clone());
        self.install_tokens.lock().unwrap().push(token);

        if self.fail_install.load(Ordering::SeqCst) {
            return Err(Error::package_manager(
                &request.release,
                &request.namespace,
                "chart not found",
            ));
        }

        let release = (
            connection.server().to_string(),
            request.namespace.clone(),
            request.release.clone(),
        );
        if !self.releases.lock().unwrap().insert(release) {
            return Err(Error::ReleaseAlreadyInstalled {
                release: request.release.clone(),
                namespace: request.namespace.clone(),
            });
        }

        if let Some(cluster) = self.clusters.get(connection.server()) {
            cluster.add_crd(&format!("certificaterequests.{}", AGENT_CRD_GROUP), AGENT_CRD_GROUP);
            cluster.add_crd(&format!("issuedcertificates.{}", AGENT_CRD_GROUP), AGENT_CRD_GROUP);
            cluster.add_secret(&request.namespace, "intermediate-ca", CERT_SECRET_TYPE);
        }
        Ok(())
    }

    async fn uninstall(
        &self,
        connection: &ClusterConnection,
        namespace: &str,
        release: &str,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let removed = self.releases.lock().unwrap().remove(&(
            connection.server().to_string(),
            namespace.to_string(),
            release.to_string(),
        ));
        if removed {
            Ok(())
        } else {
            Err(Error::ReleaseNotFound {
                release: release.to_string(),
                namespace: namespace.to_string(),
            })
        }
    }
}

/// Routes connections to fake clusters by server URL
pub struct FakeClientProvider {
    registry: Arc<FakeRegistry>,
    clusters: BTreeMap<String, Arc<FakeCluster>>,
    cache: Mutex<BTreeMap<String, Arc<dyn RemoteClusterApi>>>,
    evicted: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeClientProvider {
    pub fn new(registry: Arc<FakeRegistry>, clusters: &[Arc<FakeCluster>]) -> Self {
        Self {
            registry,
            clusters: clusters
                .iter()
                .map(|c| (c.server().to_string(), c.clone()))
                .collect(),
            cache: Mutex::new(BTreeMap::new()),
            evicted: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn evicted(&self) -> Vec<String> {
        self.evicted.lock().unwrap().clone()
    }

    fn route(&self, connection: &ClusterConnection) -> Result<Arc<dyn RemoteClusterApi>> {
        self.clusters
            .get(connection.server())
            .map(|c| c.clone() as Arc<dyn RemoteClusterApi>)
            .ok_or_else(|| Error::kubeconfig(format!("unreachable server {}", connection.server())))
    }
}

#[async_trait]
impl ClientProvider for FakeClientProvider {
    async fn for_connection(
        &self,
        connection: &ClusterConnection,
    ) -> Result<Arc<dyn RemoteClusterApi>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.route(connection)
    }

    async fn for_cluster(&self, cluster: &str) -> Result<Arc<dyn RemoteClusterApi>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let resolved = resolve(self.registry.as_ref(), cluster).await?;
        self.route(&resolved.connection)
    }

    async fn for_resolved(
        &self,
        cluster: &str,
        connection: &ClusterConnection,
    ) -> Result<Arc<dyn RemoteClusterApi>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remote = self.route(connection)?;
        self.cache
            .lock()
            .unwrap()
            .insert(cluster.to_string(), remote.clone());
        Ok(remote)
    }

    fn cached(&self, cluster: &str) -> Option<Arc<dyn RemoteClusterApi>> {
        self.cache.lock().unwrap().get(cluster).cloned()
    }

    fn evict(&self, cluster: &str) {
        self.cache.lock().unwrap().remove(cluster);
        self.evicted.lock().unwrap().push(cluster.to_string());
    }
}

/// A management cluster and one remote cluster wired together
pub struct FakeWorld {
    pub registry: Arc<FakeRegistry>,
    pub remote: Arc<FakeCluster>,
    pub packages: Arc<FakePackageManager>,
    pub clients: Arc<FakeClientProvider>,
}

impl FakeWorld {
    pub fn new() -> Self {
        let registry = Arc::new(FakeRegistry::default());
        let remote = Arc::new(FakeCluster::new(REMOTE_SERVER));
        let packages = Arc::new(FakePackageManager::new(&[remote.clone()]));
        let clients = Arc::new(FakeClientProvider::new(registry.clone(), &[remote.clone()]));
        Self {
            registry,
            remote,
            packages,
            clients,
        }
    }

    /// Total calls that reached the remote cluster or its package manager
    pub fn remote_calls(&self) -> usize {
        self.remote.calls() + self.packages.calls() + self.clients.calls()
    }
}
