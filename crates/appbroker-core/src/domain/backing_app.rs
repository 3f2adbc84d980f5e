use crate::error::{ProvisioningError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Deployment lifecycle of the backing applications of one instance.
///
/// Success path: `NotDeployed -> DeployRequested -> Deploying -> Deployed`.
/// Re-provision path: `Deploying -> UpdateRequested -> Updating -> Deployed`.
/// Any in-flight state may move to `Failed`. Nothing moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackingAppState {
    /// No deploy has been acknowledged by the deployer
    NotDeployed,

    /// Deploy issued, deployer has not started yet
    DeployRequested,

    /// Deployer is rolling the apps out
    Deploying,

    /// Update issued for a changed manifest set
    UpdateRequested,

    /// Deployer is applying the update
    Updating,

    /// Every backing app reported success
    Deployed,

    /// At least one backing app failed
    Failed,
}

impl BackingAppState {
    fn rank(self) -> u8 {
        match self {
            BackingAppState::NotDeployed => 0,
            BackingAppState::DeployRequested => 1,
            BackingAppState::Deploying => 2,
            BackingAppState::UpdateRequested => 3,
            BackingAppState::Updating => 4,
            BackingAppState::Deployed => 5,
            BackingAppState::Failed => 6,
        }
    }

    /// Deploy or update has been issued and not yet resolved
    #[inline]
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            BackingAppState::DeployRequested
                | BackingAppState::Deploying
                | BackingAppState::UpdateRequested
                | BackingAppState::Updating
        )
    }

    /// No further transition is possible
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, BackingAppState::Deployed | BackingAppState::Failed)
    }

    /// The instance is on the re-provision path
    #[inline]
    pub fn is_updating(self) -> bool {
        matches!(
            self,
            BackingAppState::UpdateRequested | BackingAppState::Updating
        )
    }

    /// Whether `next` is reachable from `self` in one transition.
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: BackingAppState) -> bool {
        use BackingAppState::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (NotDeployed, DeployRequested) => true,
            (DeployRequested, Deploying | Deployed) => true,
            (Deploying, UpdateRequested | Deployed) => true,
            (UpdateRequested, Updating | Deployed) => true,
            (Updating, Deployed) => true,
            (from, Failed) => from.is_in_progress(),
            _ => false,
        }
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow
    pub fn transition(self, next: BackingAppState) -> Result<BackingAppState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ProvisioningError::InternalConsistency(format!(
                "illegal backing app state transition {} -> {}",
                self, next
            )))
        }
    }

    /// Fold a state observed from the deployer into the current one.
    ///
    /// Observations that would move backwards are "no progress" and keep the
    /// current state; only forward moves and failures are applied.
    pub fn advance(self, observed: BackingAppState) -> Result<BackingAppState> {
        if observed != BackingAppState::Failed && observed.rank() <= self.rank() {
            return Ok(self);
        }
        self.transition(observed)
    }

    /// Map a deployer status into the lifecycle phase of `self`
    pub fn observe(self, status: &DeploymentStatus) -> BackingAppState {
        match status {
            DeploymentStatus::Pending if self.is_updating() => BackingAppState::UpdateRequested,
            DeploymentStatus::Pending => BackingAppState::DeployRequested,
            DeploymentStatus::InProgress if self.is_updating() => BackingAppState::Updating,
            DeploymentStatus::InProgress => BackingAppState::Deploying,
            DeploymentStatus::Succeeded => BackingAppState::Deployed,
            DeploymentStatus::Failed { .. } => BackingAppState::Failed,
        }
    }

    /// Aggregate the states of several backing apps into one.
    ///
    /// `Failed` if any app failed, `Deployed` only if all succeeded, otherwise
    /// the most advanced in-progress state. Returns `None` for no apps.
    pub fn aggregate<I>(states: I) -> Option<BackingAppState>
    where
        I: IntoIterator<Item = BackingAppState>,
    {
        let mut seen = false;
        let mut most_advanced: Option<BackingAppState> = None;

        for state in states {
            seen = true;
            match state {
                BackingAppState::Failed => return Some(BackingAppState::Failed),
                BackingAppState::Deployed => {}
                other => {
                    if most_advanced.map_or(true, |current| other.rank() > current.rank()) {
                        most_advanced = Some(other);
                    }
                }
            }
        }

        if !seen {
            None
        } else {
            Some(most_advanced.unwrap_or(BackingAppState::Deployed))
        }
    }
}

impl fmt::Display for BackingAppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackingAppState::NotDeployed => "NOT_DEPLOYED",
            BackingAppState::DeployRequested => "DEPLOY_REQUESTED",
            BackingAppState::Deploying => "DEPLOYING",
            BackingAppState::UpdateRequested => "UPDATE_REQUESTED",
            BackingAppState::Updating => "UPDATING",
            BackingAppState::Deployed => "DEPLOYED",
            BackingAppState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Value object: Handle returned by the deployer for one deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentHandle(pub String);

/// Status reported by the deployer when polled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    /// Accepted but not started
    Pending,
    /// Rolling out
    InProgress,
    /// Running
    Succeeded,
    /// Failed, with the platform's reason
    Failed {
        /// Failure reason
        reason: String,
    },
}

/// Deployment manifest for one backing application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackingAppManifest {
    /// Backing app name, unique within the plan
    pub name: String,

    /// Stable name of the deployment on the target platform
    pub deployment_name: String,

    /// Artifact location
    pub path: String,

    /// Deployer properties (memory, instances, ...)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Application environment
    #[serde(default)]
    pub environment: BTreeMap<String, Value>,
}

impl BackingAppManifest {
    /// Create a manifest for an app of the given instance
    pub fn new(instance_id: &str, name: impl Into<String>, path: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            deployment_name: format!("{}-{}", instance_id, name),
            name,
            path: path.into(),
            properties: BTreeMap::new(),
            environment: BTreeMap::new(),
        }
    }
}

/// SHA-256 digest over a manifest set, hex encoded
pub fn manifest_digest(manifests: &[BackingAppManifest]) -> Result<String> {
    let encoded = serde_json::to_vec(manifests)?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}
