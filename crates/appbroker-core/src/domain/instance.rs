use crate::domain::backing_app::{BackingAppState, DeploymentHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Value object: Service instance ID, assigned by the marketplace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

/// Value object: Service definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub String);

/// Value object: Service plan ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub String);

/// Value object: Token identifying an asynchronous provisioning operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    /// Generate a fresh operation token
    pub fn generate() -> Self {
        Self(format!("provision-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform and organizational context used to select a deployment target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformContext {
    /// Platform name (e.g. "cloudfoundry", "kubernetes")
    pub platform: String,

    /// Organization the instance is created in
    #[serde(default)]
    pub organization_guid: Option<String>,

    /// Space the instance is created in
    #[serde(default)]
    pub space_guid: Option<String>,

    /// Any additional platform properties
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Snapshot of a create-service-instance request.
///
/// Fields are private and only readable once constructed, so a request
/// captured at first receipt cannot be re-purposed by later steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationRequest {
    instance_id: InstanceId,
    service_id: ServiceId,
    plan_id: PlanId,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default)]
    context: PlatformContext,
}

impl CreationRequest {
    /// Create a new request without parameters
    pub fn new(
        instance_id: impl Into<String>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: InstanceId(instance_id.into()),
            service_id: ServiceId(service_id.into()),
            plan_id: PlanId(plan_id.into()),
            parameters: BTreeMap::new(),
            context: PlatformContext::default(),
        }
    }

    /// Add a caller-supplied parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Replace all caller-supplied parameters
    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the platform context
    pub fn with_context(mut self, context: PlatformContext) -> Self {
        self.context = context;
        self
    }

    /// Instance identity
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Requested service
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Requested plan
    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// Caller-supplied parameters
    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    /// Platform context
    pub fn context(&self) -> &PlatformContext {
        &self.context
    }
}

/// Durable record of one service instance, as kept by the instance state store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Request captured at first receipt
    pub request: CreationRequest,

    /// Aggregated backing-app state
    pub state: BackingAppState,

    /// Deployment handle per backing app name
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploymentHandle>,

    /// Digest of the manifests the current deployments were requested with
    #[serde(default)]
    pub manifest_digest: Option<String>,

    /// Backing apps the current deployments were requested for
    #[serde(default)]
    pub planned_apps: BTreeSet<String>,

    /// Progress of an update interrupted part-way
    #[serde(default)]
    pub pending_update: Option<PendingUpdate>,

    /// Operation token handed back on every accepted response
    pub operation: OperationId,

    /// First failure reason reported by the deployer
    #[serde(default)]
    pub failure: Option<String>,

    /// Set once the instance has been finalized as provisioned
    #[serde(default)]
    pub provisioned: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Apps already updated towards a manifest set whose update did not complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    /// Digest of the manifest set being applied
    pub digest: String,

    /// Apps the deployer acknowledged for that digest
    pub apps: BTreeSet<String>,
}

impl InstanceRecord {
    /// Create the record written at first receipt of a request
    pub fn new(request: CreationRequest, operation: OperationId) -> Self {
        let now = Utc::now();
        Self {
            request,
            state: BackingAppState::NotDeployed,
            deployments: BTreeMap::new(),
            manifest_digest: None,
            planned_apps: BTreeSet::new(),
            pending_update: None,
            operation,
            failure: None,
            provisioned: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Instance identity this record belongs to
    #[inline]
    pub fn instance_id(&self) -> &InstanceId {
        self.request.instance_id()
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
