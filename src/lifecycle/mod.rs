//! Registration and deregistration orchestrators
//!
//! [`ClusterLifecycle`] sequences the credential exchange, connection
//! sanitization, agent lifecycle and registry writes into the two end-to-end
//! protocols. Steps run strictly in order, every remote call is raced against
//! the caller's [`CancellationToken`](tokio_util::sync::CancellationToken),
//! and the first failure is returned wrapped with the cluster name and the
//! step that failed. There is no rollback: re-running the same operation is
//! the recovery path.

mod deregister;
mod register;

use std::sync::Arc;

use crate::agent::{AgentManager, PackageManager};
use crate::config::MeshplaneConfig;
use crate::registry::ClusterRegistry;
use crate::remote::ClientProvider;

pub use register::{RegistrationOptions, RegistrationRequest};

/// Orchestrates cluster registration and deregistration
pub struct ClusterLifecycle {
    registry: Arc<dyn ClusterRegistry>,
    clients: Arc<dyn ClientProvider>,
    agent: AgentManager,
    config: MeshplaneConfig,
}

impl ClusterLifecycle {
    /// Wire the orchestrators to their collaborators
    pub fn new(
        registry: Arc<dyn ClusterRegistry>,
        clients: Arc<dyn ClientProvider>,
        package_manager: Arc<dyn PackageManager>,
        config: MeshplaneConfig,
    ) -> Self {
        let agent = AgentManager::new(package_manager, config.agent.clone());
        Self {
            registry,
            clients,
            agent,
            config,
        }
    }

    /// The configuration in use
    pub fn config(&self) -> &MeshplaneConfig {
        &self.config
    }
}

#[cfg(test)]
impl ClusterLifecycle {
    pub(crate) fn for_world(world: &crate::testing::FakeWorld) -> Self {
        Self::new(
            world.registry.clone(),
            world.clients.clone(),
            world.packages.clone(),
            MeshplaneConfig::default(),
        )
    }
}
