//!
//! App Broker Core - Provisioning workflow for service instances
//!
//! This crate turns create-service-instance calls from a service marketplace
//! into deployments of backing applications on an application platform. It
//! owns the domain model, the backing-app lifecycle and the workflow engine.
//! Persistence, the platform deployment API and manifest templating are
//! plugged in through the traits in [`domain::repository`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - instances, backing apps and collaborator interfaces
pub mod domain;

/// Application services - the provisioning workflow
pub mod application;

/// Error types
pub mod error;

// Re-export key types
pub use error::{DeployerError, ProvisioningError, Result, StoreError};

pub use application::instance_locks::{InstanceLockGuard, InstanceLocks};
pub use application::provisioning_service::{
    DomainEventHandler, LoggingEventHandler, ProvisioningOutcome, ProvisioningService,
};
pub use application::status_reporter::StatusReport;

pub use domain::backing_app::{
    manifest_digest, BackingAppManifest, BackingAppState, DeploymentHandle, DeploymentStatus,
};
pub use domain::context::RequestContext;
pub use domain::events::DomainEvent;
pub use domain::instance::{
    CreationRequest, InstanceId, InstanceRecord, OperationId, PendingUpdate, PlanId, PlatformContext,
    ServiceId,
};
pub use domain::repository::{
    BackingAppDeployer, InstanceStateStore, ManifestResolver, PlanAndParametersEquivalence,
    RequestEquivalence,
};
