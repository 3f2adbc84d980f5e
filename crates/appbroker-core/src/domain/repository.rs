//! Collaborator traits for the provisioning workflow
//!
//! This module defines the seams the workflow engine talks through: the
//! instance state store, the backing-app deployer, the manifest resolver and
//! the request equivalence rule. External crates implement them to plug in
//! persistence and platform clients.

use async_trait::async_trait;

use super::backing_app::{BackingAppManifest, DeploymentHandle, DeploymentStatus};
use super::instance::{CreationRequest, InstanceId, InstanceRecord};
use crate::error::{DeployerError, ProvisioningError, StoreError};

/// Durable record of instance id -> last known deployment state and request.
///
/// Writes for one identity are only issued while the engine holds that
/// identity's lock, so last-writer-wins `put` is sufficient in one process.
#[async_trait]
pub trait InstanceStateStore: Send + Sync {
    /// Find the record of an instance
    async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError>;

    /// Save a record, replacing any previous one
    async fn put(&self, record: &InstanceRecord) -> Result<(), StoreError>;

    /// Save a record only if none exists for its identity.
    /// Returns `false` when another writer got there first.
    async fn create_if_absent(&self, record: &InstanceRecord) -> Result<bool, StoreError>;

    /// Remove the record of an instance
    async fn reset(&self, id: &InstanceId) -> Result<(), StoreError>;

    /// Whether a failed record may be discarded by a fresh creation call
    fn permits_reset(&self, _record: &InstanceRecord) -> bool {
        false
    }
}

/// Platform deployment API. All calls may be slow; none is assumed to
/// complete the deployment synchronously.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackingAppDeployer: Send + Sync {
    /// Start deploying a backing app
    async fn deploy(&self, manifest: &BackingAppManifest) -> Result<DeploymentHandle, DeployerError>;

    /// Re-apply a changed manifest to an existing deployment
    async fn update(
        &self,
        handle: &DeploymentHandle,
        manifest: &BackingAppManifest,
    ) -> Result<DeploymentHandle, DeployerError>;

    /// Query the status of a deployment
    async fn poll(&self, handle: &DeploymentHandle) -> Result<DeploymentStatus, DeployerError>;
}

/// Produces backing app manifests for a creation request
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Resolve the manifests of every backing app the request's plan needs
    async fn resolve(
        &self,
        request: &CreationRequest,
    ) -> Result<Vec<BackingAppManifest>, ProvisioningError>;
}

/// Decides whether a repeated request is the same logical request
pub trait RequestEquivalence: Send + Sync {
    /// `true` if `incoming` may be treated as a re-delivery of `stored`
    fn equivalent(&self, stored: &CreationRequest, incoming: &CreationRequest) -> bool;
}

/// Requests are equivalent when service, plan and parameters match.
/// Platform context is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanAndParametersEquivalence;

impl RequestEquivalence for PlanAndParametersEquivalence {
    fn equivalent(&self, stored: &CreationRequest, incoming: &CreationRequest) -> bool {
        stored.instance_id() == incoming.instance_id()
            && stored.service_id() == incoming.service_id()
            && stored.plan_id() == incoming.plan_id()
            && stored.parameters() == incoming.parameters()
    }
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory instance store with failure injection
    #[derive(Default)]
    pub struct MemoryInstanceStateStore {
        records: DashMap<InstanceId, InstanceRecord>,
        unavailable: AtomicBool,
        allow_reset: AtomicBool,
        writes: AtomicUsize,
    }

    impl MemoryInstanceStateStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every call fail with `StoreError::Unavailable`
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Allow failed records to be reset
        pub fn set_allow_reset(&self, allow: bool) {
            self.allow_reset.store(allow, Ordering::SeqCst);
        }

        /// Number of successful writes
        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        /// Direct read without going through the trait
        pub fn snapshot(&self, id: &str) -> Option<InstanceRecord> {
            self.records
                .get(&InstanceId(id.to_string()))
                .map(|record| record.clone())
        }

        /// Seed a record
        pub fn insert(&self, record: InstanceRecord) {
            self.records.insert(record.instance_id().clone(), record);
        }

        fn check_available(&self) -> Result<(), StoreError> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("memory store switched off".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl InstanceStateStore for MemoryInstanceStateStore {
        async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
            self.check_available()?;
            Ok(self.records.get(id).map(|record| record.clone()))
        }

        async fn put(&self, record: &InstanceRecord) -> Result<(), StoreError> {
            self.check_available()?;
            self.records
                .insert(record.instance_id().clone(), record.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create_if_absent(&self, record: &InstanceRecord) -> Result<bool, StoreError> {
            self.check_available()?;
            let mut created = false;
            self.records
                .entry(record.instance_id().clone())
                .or_insert_with(|| {
                    created = true;
                    record.clone()
                });
            if created {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(created)
        }

        async fn reset(&self, id: &InstanceId) -> Result<(), StoreError> {
            self.check_available()?;
            self.records.remove(id);
            Ok(())
        }

        fn permits_reset(&self, _record: &InstanceRecord) -> bool {
            self.allow_reset.load(Ordering::SeqCst)
        }
    }

    /// Deployer whose poll answers are scripted per backing app name.
    ///
    /// Each poll pops the next scripted answer; the last one repeats. Apps
    /// without a script report `InProgress`.
    #[derive(Default)]
    pub struct ScriptedDeployer {
        scripts: DashMap<String, VecDeque<Result<DeploymentStatus, DeployerError>>>,
        deploy_failures: DashMap<String, DeployerError>,
        update_failures: DashMap<String, DeployerError>,
        handles: DashMap<DeploymentHandle, String>,
        deploy_calls: AtomicUsize,
        update_calls: AtomicUsize,
        poll_calls: AtomicUsize,
    }

    impl ScriptedDeployer {
        /// Create a deployer with no scripts
        pub fn new() -> Self {
            Self::default()
        }

        /// Append poll answers for an app
        pub fn script_polls(&self, app: &str, answers: Vec<DeploymentStatus>) {
            let mut script = self.scripts.entry(app.to_string()).or_default();
            script.extend(answers.into_iter().map(Ok));
        }

        /// Append a poll error for an app
        pub fn script_poll_error(&self, app: &str, error: DeployerError) {
            self.scripts
                .entry(app.to_string())
                .or_default()
                .push_back(Err(error));
        }

        /// Fail the next deploy call for an app
        pub fn fail_next_deploy(&self, app: &str, error: DeployerError) {
            self.deploy_failures.insert(app.to_string(), error);
        }

        /// Fail the next update call for an app
        pub fn fail_next_update(&self, app: &str, error: DeployerError) {
            self.update_failures.insert(app.to_string(), error);
        }

        /// Number of deploy calls, failed ones included
        pub fn deploy_calls(&self) -> usize {
            self.deploy_calls.load(Ordering::SeqCst)
        }

        /// Number of update calls, failed ones included
        pub fn update_calls(&self) -> usize {
            self.update_calls.load(Ordering::SeqCst)
        }

        /// Number of poll calls
        pub fn poll_calls(&self) -> usize {
            self.poll_calls.load(Ordering::SeqCst)
        }

        fn issue_handle(&self, manifest: &BackingAppManifest, kind: &str, seq: usize) -> DeploymentHandle {
            let handle = DeploymentHandle(format!("{}-{}-{}", manifest.deployment_name, kind, seq));
            self.handles.insert(handle.clone(), manifest.name.clone());
            handle
        }
    }

    #[async_trait]
    impl BackingAppDeployer for ScriptedDeployer {
        async fn deploy(&self, manifest: &BackingAppManifest) -> Result<DeploymentHandle, DeployerError> {
            let seq = self.deploy_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((_, error)) = self.deploy_failures.remove(&manifest.name) {
                return Err(error);
            }
            Ok(self.issue_handle(manifest, "deploy", seq))
        }

        async fn update(
            &self,
            _handle: &DeploymentHandle,
            manifest: &BackingAppManifest,
        ) -> Result<DeploymentHandle, DeployerError> {
            let seq = self.update_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((_, error)) = self.update_failures.remove(&manifest.name) {
                return Err(error);
            }
            Ok(self.issue_handle(manifest, "update", seq))
        }

        async fn poll(&self, handle: &DeploymentHandle) -> Result<DeploymentStatus, DeployerError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            let app = self
                .handles
                .get(handle)
                .map(|app| app.clone())
                .ok_or_else(|| DeployerError::Permanent(format!("unknown deployment {}", handle.0)))?;

            let mut script = match self.scripts.get_mut(&app) {
                Some(script) => script,
                None => return Ok(DeploymentStatus::InProgress),
            };

            if script.len() > 1 {
                script
                    .pop_front()
                    .unwrap_or(Ok(DeploymentStatus::InProgress))
            } else {
                script
                    .front()
                    .cloned()
                    .unwrap_or(Ok(DeploymentStatus::InProgress))
            }
        }
    }

    /// Resolver returning the same app list for every plan
    pub struct StaticManifestResolver {
        apps: Vec<(String, String)>,
    }

    impl StaticManifestResolver {
        /// Apps given as `(name, path)` pairs
        pub fn new(apps: &[(&str, &str)]) -> Self {
            Self {
                apps: apps
                    .iter()
                    .map(|(name, path)| (name.to_string(), path.to_string()))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl ManifestResolver for StaticManifestResolver {
        async fn resolve(
            &self,
            request: &CreationRequest,
        ) -> Result<Vec<BackingAppManifest>, ProvisioningError> {
            Ok(self
                .apps
                .iter()
                .map(|(name, path)| {
                    let mut manifest =
                        BackingAppManifest::new(&request.instance_id().0, name.as_str(), path.as_str());
                    manifest.environment.extend(request.parameters().clone());
                    manifest
                })
                .collect())
        }
    }
}
