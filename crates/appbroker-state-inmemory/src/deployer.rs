//! Simulated platform deployer
//!
//! Deployments move through `Pending`, `InProgress` and finally `Succeeded`
//! (or `Failed` for apps configured to fail) after a fixed number of polls.
//! Useful for local runs of the broker without a real platform.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use async_trait::async_trait;
use uuid::Uuid;

use appbroker_core::{
    BackingAppDeployer, BackingAppManifest, DeployerError, DeploymentHandle, DeploymentStatus,
};

/// One deployment tracked by the simulated platform
#[derive(Debug, Clone)]
struct SimulatedDeployment {
    app: String,
    deployment_name: String,
    polls: u32,
}

/// Deployer that completes every deployment after a number of polls
pub struct SimulatedDeployer {
    deployments: Arc<RwLock<HashMap<DeploymentHandle, SimulatedDeployment>>>,
    polls_until_ready: u32,
    failing_apps: HashMap<String, String>,
}

impl SimulatedDeployer {
    /// Create a deployer whose deployments succeed on the given poll
    pub fn new(polls_until_ready: u32) -> Self {
        Self {
            deployments: Arc::new(RwLock::new(HashMap::new())),
            polls_until_ready: polls_until_ready.max(1),
            failing_apps: HashMap::new(),
        }
    }

    /// Make every deployment of an app end in failure
    pub fn with_failing_app(mut self, app: impl Into<String>, reason: impl Into<String>) -> Self {
        self.failing_apps.insert(app.into(), reason.into());
        self
    }

    /// Number of deployments the platform knows about
    pub async fn deployment_count(&self) -> usize {
        self.deployments.read().await.len()
    }

    async fn start(&self, manifest: &BackingAppManifest) -> DeploymentHandle {
        let handle = DeploymentHandle(format!("{}-{}", manifest.deployment_name, Uuid::new_v4()));
        let deployment = SimulatedDeployment {
            app: manifest.name.clone(),
            deployment_name: manifest.deployment_name.clone(),
            polls: 0,
        };

        self.deployments.write().await.insert(handle.clone(), deployment);
        handle
    }
}

impl Default for SimulatedDeployer {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl BackingAppDeployer for SimulatedDeployer {
    async fn deploy(&self, manifest: &BackingAppManifest) -> Result<DeploymentHandle, DeployerError> {
        if manifest.path.is_empty() {
            return Err(DeployerError::Permanent(format!(
                "no artifact path for {}",
                manifest.deployment_name
            )));
        }

        let handle = self.start(manifest).await;
        info!(deployment = %manifest.deployment_name, handle = %handle.0, "Simulated deploy started");
        Ok(handle)
    }

    async fn update(
        &self,
        handle: &DeploymentHandle,
        manifest: &BackingAppManifest,
    ) -> Result<DeploymentHandle, DeployerError> {
        let removed = self.deployments.write().await.remove(handle);
        if removed.is_none() {
            return Err(DeployerError::Permanent(format!("unknown deployment {}", handle.0)));
        }

        let handle = self.start(manifest).await;
        info!(deployment = %manifest.deployment_name, handle = %handle.0, "Simulated update started");
        Ok(handle)
    }

    async fn poll(&self, handle: &DeploymentHandle) -> Result<DeploymentStatus, DeployerError> {
        let mut deployments = self.deployments.write().await;
        let deployment = deployments
            .get_mut(handle)
            .ok_or_else(|| DeployerError::Permanent(format!("unknown deployment {}", handle.0)))?;

        deployment.polls += 1;
        let status = if deployment.polls == 1 && self.polls_until_ready > 1 {
            DeploymentStatus::Pending
        } else if deployment.polls < self.polls_until_ready {
            DeploymentStatus::InProgress
        } else if let Some(reason) = self.failing_apps.get(&deployment.app) {
            DeploymentStatus::Failed {
                reason: reason.clone(),
            }
        } else {
            DeploymentStatus::Succeeded
        };

        debug!(
            deployment = %deployment.deployment_name,
            polls = deployment.polls,
            status = ?status,
            "Simulated poll"
        );
        Ok(status)
    }
}
