use crate::domain::backing_app::BackingAppState;
use crate::domain::instance::{InstanceId, OperationId};
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the service instance ID this event is associated with
    fn instance_id(&self) -> &InstanceId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Event: First receipt of a creation request was recorded
#[derive(Debug)]
pub struct InstanceCreationRequested {
    /// The service instance
    pub instance_id: InstanceId,

    /// Operation token issued for the request
    pub operation: OperationId,

    /// The timestamp when the request was recorded
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceCreationRequested {
    fn event_type(&self) -> &'static str {
        "service_instance.creation_requested"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Deploy was issued for backing apps
#[derive(Debug)]
pub struct BackingAppsDeployRequested {
    /// The service instance
    pub instance_id: InstanceId,

    /// Names of the apps a deploy was issued for
    pub apps: Vec<String>,

    /// The timestamp when the deploys were acknowledged
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for BackingAppsDeployRequested {
    fn event_type(&self) -> &'static str {
        "backing_apps.deploy_requested"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Update was issued for backing apps after their manifests changed
#[derive(Debug)]
pub struct BackingAppsUpdateRequested {
    /// The service instance
    pub instance_id: InstanceId,

    /// Names of the apps an update was issued for
    pub apps: Vec<String>,

    /// Digest of the new manifest set
    pub manifest_digest: String,

    /// The timestamp when the updates were acknowledged
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for BackingAppsUpdateRequested {
    fn event_type(&self) -> &'static str {
        "backing_apps.update_requested"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Aggregated backing-app state moved forward
#[derive(Debug)]
pub struct BackingAppStateAdvanced {
    /// The service instance
    pub instance_id: InstanceId,

    /// State before the transition
    pub from: BackingAppState,

    /// State after the transition
    pub to: BackingAppState,

    /// The timestamp of the transition
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for BackingAppStateAdvanced {
    fn event_type(&self) -> &'static str {
        "backing_apps.state_advanced"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Instance was finalized as provisioned
#[derive(Debug)]
pub struct InstanceProvisioned {
    /// The service instance
    pub instance_id: InstanceId,

    /// The timestamp when the instance was finalized
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceProvisioned {
    fn event_type(&self) -> &'static str {
        "service_instance.provisioned"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Provisioning failed terminally
#[derive(Debug)]
pub struct InstanceProvisioningFailed {
    /// The service instance
    pub instance_id: InstanceId,

    /// Failure reason reported by the deployer
    pub reason: String,

    /// The timestamp when the failure was recorded
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceProvisioningFailed {
    fn event_type(&self) -> &'static str {
        "service_instance.provisioning_failed"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
