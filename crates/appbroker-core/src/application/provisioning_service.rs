use crate::{
    application::instance_locks::InstanceLocks,
    domain::backing_app::{
        manifest_digest, BackingAppManifest, BackingAppState, DeploymentHandle, DeploymentStatus,
    },
    domain::context::RequestContext,
    domain::events::{BackingAppsDeployRequested, BackingAppsUpdateRequested, DomainEvent},
    domain::instance::{CreationRequest, InstanceId, InstanceRecord, OperationId},
    domain::repository::{
        BackingAppDeployer, InstanceStateStore, ManifestResolver, PlanAndParametersEquivalence,
        RequestEquivalence,
    },
    error::{DeployerError, ProvisioningError, Result},
};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// Upper bound on dispatch rounds in one invocation
const MAX_STEPS_PER_INVOCATION: usize = 8;

/// Result of one workflow invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// Every backing app is deployed and the instance is finalized
    Created {
        /// Operation token of the provisioning
        operation: OperationId,
    },
    /// Deployment continues; the caller is expected to poll
    Accepted {
        /// Operation token to poll with
        operation: OperationId,
    },
}

/// Handler for domain events
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<()>;
}

/// Event handler writing every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventHandler;

#[async_trait]
impl DomainEventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<()> {
        info!(
            event_type = event.event_type(),
            instance_id = %event.instance_id(),
            timestamp = %event.timestamp(),
            "Domain event"
        );
        Ok(())
    }
}

/// Manifests resolved for the current invocation, with their digest
struct ResolvedManifests {
    manifests: Vec<BackingAppManifest>,
    digest: String,
}

impl ResolvedManifests {
    fn has_undeployed(&self, context: &RequestContext) -> bool {
        self.manifests
            .iter()
            .any(|manifest| context.deployment(&manifest.name).is_none())
    }

    fn differs_from(&self, context: &RequestContext) -> bool {
        context.manifest_digest() != Some(self.digest.as_str())
    }
}

/// Workflow step selected for a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkflowStep {
    Deploy,
    Update,
    Poll,
    Finalize,
    ReportFailure,
}

impl WorkflowStep {
    /// Dispatch table keyed by (instance existed, backing-app state). First
    /// receipt and poll re-entry go through the same table.
    fn select(context: &RequestContext, manifests: Option<&ResolvedManifests>) -> Self {
        use BackingAppState::*;

        let undeployed = manifests.map_or(false, |m| m.has_undeployed(context));
        let changed = manifests.map_or(false, |m| m.differs_from(context));

        match (context.instance_existed(), context.backing_app_state()) {
            // An existing NOT_DEPLOYED record was persisted but never had a
            // deploy acknowledged, so deploying is still the first side effect.
            (_, NotDeployed) => WorkflowStep::Deploy,
            (_, DeployRequested) if undeployed => WorkflowStep::Deploy,
            (true, Deploying | UpdateRequested) if changed => WorkflowStep::Update,
            (_, Deployed) => WorkflowStep::Finalize,
            (_, Failed) => WorkflowStep::ReportFailure,
            (_, DeployRequested | Deploying | UpdateRequested | Updating) => WorkflowStep::Poll,
        }
    }
}

/// Whether a poll settled the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollProgress {
    InProgress,
    Settled,
}

type DeployResults = Vec<(String, std::result::Result<DeploymentHandle, DeployerError>)>;

/// Service turning creation requests into backing-app deployments
#[derive(Clone)]
pub struct ProvisioningService {
    /// Durable instance records
    store: Arc<dyn InstanceStateStore>,

    /// Platform deployment API
    deployer: Arc<dyn BackingAppDeployer>,

    /// Manifest resolution for plans
    resolver: Arc<dyn ManifestResolver>,

    /// Rule for detecting re-delivered requests
    equivalence: Arc<dyn RequestEquivalence>,

    /// Event handler
    event_handler: Arc<dyn DomainEventHandler>,

    /// Identity locks serializing invocations per instance
    locks: InstanceLocks,
}

impl ProvisioningService {
    /// Create a new provisioning service
    pub fn new(
        store: Arc<dyn InstanceStateStore>,
        deployer: Arc<dyn BackingAppDeployer>,
        resolver: Arc<dyn ManifestResolver>,
        event_handler: Arc<dyn DomainEventHandler>,
    ) -> Self {
        Self {
            store,
            deployer,
            resolver,
            equivalence: Arc::new(PlanAndParametersEquivalence),
            event_handler,
            locks: InstanceLocks::new(),
        }
    }

    /// Replace the request equivalence rule
    pub fn with_equivalence(mut self, equivalence: Arc<dyn RequestEquivalence>) -> Self {
        self.equivalence = equivalence;
        self
    }

    /// Lock table used by this service
    pub fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    /// Current stored record of an instance
    pub async fn instance_record(&self, instance_id: &InstanceId) -> Result<Option<InstanceRecord>> {
        Ok(self.store.get(instance_id).await?)
    }

    /// Handle a create-service-instance call, first receipt or re-delivery
    #[instrument(skip_all, fields(instance_id = %request.instance_id()))]
    pub async fn create_service_instance(
        &self,
        request: CreationRequest,
    ) -> Result<ProvisioningOutcome> {
        let instance_id = request.instance_id().clone();
        let _guard = self.locks.acquire(&instance_id).await;

        info!(
            service_id = %request.service_id().0,
            plan_id = %request.plan_id().0,
            "Received create service instance request"
        );

        let (mut context, resolved) = self.load_or_create(request).await?;
        let result = self.run(&mut context, resolved).await;
        log_result(&instance_id, &result);
        result
    }

    /// Handle a last-operation poll for an instance
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn last_operation(&self, instance_id: &InstanceId) -> Result<ProvisioningOutcome> {
        let _guard = self.locks.acquire(instance_id).await;

        let record = self
            .store
            .get(instance_id)
            .await?
            .ok_or_else(|| ProvisioningError::InstanceNotFound(instance_id.0.clone()))?;

        let mut context = RequestContext::rehydrate(record);
        let result = self.run(&mut context, None).await;
        log_result(instance_id, &result);
        result
    }

    /// Step 1: load the stored context or record a first receipt. A first
    /// receipt resolves its manifests before anything is written, so a
    /// request for an unusable plan leaves no record behind.
    async fn load_or_create(
        &self,
        request: CreationRequest,
    ) -> Result<(RequestContext, Option<ResolvedManifests>)> {
        let mut reset = false;
        if let Some(record) = self.store.get(request.instance_id()).await? {
            if record.state != BackingAppState::Failed || !self.store.permits_reset(&record) {
                return Ok((self.rehydrate_for(record, &request)?, None));
            }
            reset = true;
        }

        let mut context = RequestContext::fresh(request.clone(), OperationId::generate());
        let resolved = self.resolve_manifests(&context).await?;

        if reset {
            info!(
                instance_id = %request.instance_id(),
                "Resetting failed service instance for a fresh creation request"
            );
            self.store.reset(request.instance_id()).await?;
        }

        if self.store.create_if_absent(context.record()).await? {
            info!(
                instance_id = %context.instance_id(),
                operation = %context.operation(),
                "Recorded new service instance request"
            );
            self.publish(&mut context).await;
            return Ok((context, Some(resolved)));
        }

        // Another writer created the record between our read and write
        warn!(
            instance_id = %request.instance_id(),
            "Lost conditional create, continuing with the stored record"
        );
        let record = self.store.get(request.instance_id()).await?.ok_or_else(|| {
            ProvisioningError::StoreUnavailable(format!(
                "record for {} vanished after a conflicting create",
                request.instance_id()
            ))
        })?;
        Ok((self.rehydrate_for(record, &request)?, None))
    }

    fn rehydrate_for(
        &self,
        record: InstanceRecord,
        request: &CreationRequest,
    ) -> Result<RequestContext> {
        if !self.equivalence.equivalent(&record.request, request) {
            warn!(
                instance_id = %record.instance_id(),
                stored_plan = %record.request.plan_id().0,
                requested_plan = %request.plan_id().0,
                state = %record.state,
                "Creation request conflicts with existing service instance"
            );
            return Err(ProvisioningError::Conflict(format!(
                "service instance {} already exists with a different request",
                record.instance_id()
            )));
        }

        debug!(
            instance_id = %record.instance_id(),
            state = %record.state,
            "Treating creation request as a re-delivery"
        );
        Ok(RequestContext::rehydrate(record))
    }

    /// Steps 2 to 4, driven by the dispatch table
    async fn run(
        &self,
        context: &mut RequestContext,
        resolved: Option<ResolvedManifests>,
    ) -> Result<ProvisioningOutcome> {
        let manifests = match resolved {
            Some(resolved) => Some(resolved),
            None => self.manifests_for(context).await?,
        };

        for _ in 0..MAX_STEPS_PER_INVOCATION {
            let step = WorkflowStep::select(context, manifests.as_ref());
            debug!(
                instance_id = %context.instance_id(),
                existed = context.instance_existed(),
                state = %context.backing_app_state(),
                step = ?step,
                "Dispatching provisioning step"
            );

            match step {
                WorkflowStep::Deploy => {
                    let resolved = require_manifests(manifests.as_ref(), step)?;
                    self.request_deploy(context, resolved).await?;
                }
                WorkflowStep::Update => {
                    let resolved = require_manifests(manifests.as_ref(), step)?;
                    self.request_update(context, resolved).await?;
                }
                WorkflowStep::Poll => {
                    if self.poll(context).await? == PollProgress::InProgress {
                        return Ok(ProvisioningOutcome::Accepted {
                            operation: context.operation().clone(),
                        });
                    }
                }
                WorkflowStep::Finalize => return self.finalize(context).await,
                WorkflowStep::ReportFailure => {
                    let reason = context
                        .failure()
                        .unwrap_or("backing application deployment failed")
                        .to_string();
                    return Err(ProvisioningError::DeployerPermanent(reason));
                }
            }
        }

        Err(ProvisioningError::InternalConsistency(format!(
            "workflow for {} did not settle in {} steps",
            context.instance_id(),
            MAX_STEPS_PER_INVOCATION
        )))
    }

    /// Manifests are required before any deploy and used to detect changes
    /// while deploying. A resolution failure only aborts the former.
    async fn manifests_for(&self, context: &RequestContext) -> Result<Option<ResolvedManifests>> {
        match context.backing_app_state() {
            BackingAppState::NotDeployed => self.resolve_manifests(context).await.map(Some),
            BackingAppState::DeployRequested => match self.resolve_manifests(context).await {
                Ok(resolved) => Ok(Some(resolved)),
                Err(err) if !context.has_unrequested_apps() => {
                    warn!(
                        instance_id = %context.instance_id(),
                        error = %err,
                        "Could not re-resolve manifests, polling the requested deployments"
                    );
                    Ok(None)
                }
                Err(err) => Err(err),
            },
            BackingAppState::Deploying | BackingAppState::UpdateRequested => {
                match self.resolve_manifests(context).await {
                    Ok(resolved) => Ok(Some(resolved)),
                    Err(err) => {
                        warn!(
                            instance_id = %context.instance_id(),
                            error = %err,
                            "Could not re-resolve manifests, skipping change detection"
                        );
                        Ok(None)
                    }
                }
            }
            _ => Ok(None),
        }
    }

    async fn resolve_manifests(&self, context: &RequestContext) -> Result<ResolvedManifests> {
        let request = context.originating_request();
        let manifests = self.resolver.resolve(request).await?;

        if manifests.is_empty() {
            return Err(ProvisioningError::ManifestResolution(format!(
                "plan {} of service {} defines no backing applications",
                request.plan_id().0,
                request.service_id().0
            )));
        }

        let mut names = HashSet::with_capacity(manifests.len());
        for manifest in &manifests {
            if !names.insert(manifest.name.as_str()) {
                return Err(ProvisioningError::ManifestResolution(format!(
                    "duplicate backing application name {}",
                    manifest.name
                )));
            }
        }

        let digest = manifest_digest(&manifests)?;
        Ok(ResolvedManifests { manifests, digest })
    }

    /// Step 2: issue deploys for every app that has no handle yet
    async fn request_deploy(
        &self,
        context: &mut RequestContext,
        resolved: &ResolvedManifests,
    ) -> Result<()> {
        if context.backing_app_state() == BackingAppState::NotDeployed {
            context.set_backing_app_state(BackingAppState::DeployRequested)?;
            context.set_manifest_digest(resolved.digest.clone());
            context.set_planned_apps(resolved.manifests.iter().map(|m| m.name.clone()));
        }

        let pending: Vec<&BackingAppManifest> = resolved
            .manifests
            .iter()
            .filter(|manifest| context.deployment(&manifest.name).is_none())
            .collect();

        let results: DeployResults = join_all(pending.into_iter().map(|manifest| async move {
            (manifest.name.clone(), self.deployer.deploy(manifest).await)
        }))
        .await;

        let (acknowledged, failure) = absorb_handles(context, results);
        if !acknowledged.is_empty() {
            let instance_id = context.instance_id().clone();
            context.record_event(Box::new(BackingAppsDeployRequested {
                instance_id,
                apps: acknowledged.clone(),
                timestamp: Utc::now(),
            }));
        }

        match failure {
            None => {
                info!(
                    instance_id = %context.instance_id(),
                    apps = ?acknowledged,
                    "Backing app deploys requested"
                );
                self.persist(context).await
            }
            Some(DeployerError::Permanent(reason)) => {
                warn!(instance_id = %context.instance_id(), reason = %reason, "Deployer rejected backing app");
                context.fail(reason)?;
                self.persist(context).await
            }
            Some(DeployerError::Transient(reason)) => {
                warn!(
                    instance_id = %context.instance_id(),
                    acknowledged = acknowledged.len(),
                    reason = %reason,
                    "Transient deployer failure while requesting deploys"
                );
                // Handles already obtained must survive so those apps are
                // never deployed twice.
                if !context.deployments().is_empty() {
                    self.persist(context).await?;
                }
                Err(ProvisioningError::DeployerTransient(reason))
            }
        }
    }

    /// Re-provision path: apply a changed manifest set while deploying
    async fn request_update(
        &self,
        context: &mut RequestContext,
        resolved: &ResolvedManifests,
    ) -> Result<()> {
        info!(
            instance_id = %context.instance_id(),
            previous_digest = ?context.manifest_digest(),
            digest = %resolved.digest,
            "Backing app manifests changed, requesting update"
        );
        context.set_backing_app_state(BackingAppState::UpdateRequested)?;

        // Apps acknowledged by an interrupted attempt at this same manifest
        // set already run it.
        let targets: Vec<(&BackingAppManifest, Option<DeploymentHandle>)> = resolved
            .manifests
            .iter()
            .filter(|manifest| !context.updated_towards(&resolved.digest, &manifest.name))
            .map(|manifest| (manifest, context.deployment(&manifest.name).cloned()))
            .collect();

        let results: DeployResults = join_all(targets.into_iter().map(|(manifest, handle)| async move {
            let result = match handle {
                Some(handle) => self.deployer.update(&handle, manifest).await,
                None => self.deployer.deploy(manifest).await,
            };
            (manifest.name.clone(), result)
        }))
        .await;

        let (acknowledged, failure) = absorb_handles(context, results);

        match failure {
            None => {
                context.set_manifest_digest(resolved.digest.clone());
                context.set_planned_apps(resolved.manifests.iter().map(|m| m.name.clone()));
                context.clear_pending_update();
                let instance_id = context.instance_id().clone();
                context.record_event(Box::new(BackingAppsUpdateRequested {
                    instance_id,
                    apps: acknowledged,
                    manifest_digest: resolved.digest.clone(),
                    timestamp: Utc::now(),
                }));
                self.persist(context).await
            }
            Some(DeployerError::Permanent(reason)) => {
                warn!(instance_id = %context.instance_id(), reason = %reason, "Deployer rejected backing app update");
                context.fail(reason)?;
                self.persist(context).await
            }
            Some(DeployerError::Transient(reason)) => {
                warn!(
                    instance_id = %context.instance_id(),
                    acknowledged = acknowledged.len(),
                    reason = %reason,
                    "Transient deployer failure while requesting updates"
                );
                // The old digest is kept so the next re-entry resumes the
                // update with the apps not acknowledged yet.
                if !acknowledged.is_empty() {
                    context.record_pending_update(&resolved.digest, acknowledged);
                    self.persist(context).await?;
                }
                Err(ProvisioningError::DeployerTransient(reason))
            }
        }
    }

    /// Step 3: poll every deployment once and fold the result into the state
    async fn poll(&self, context: &mut RequestContext) -> Result<PollProgress> {
        let current = context.backing_app_state();
        let deployments: Vec<(String, DeploymentHandle)> = context
            .deployments()
            .iter()
            .map(|(app, handle)| (app.clone(), handle.clone()))
            .collect();

        if deployments.is_empty() {
            return Err(ProvisioningError::InternalConsistency(format!(
                "instance {} is {} without recorded deployments",
                context.instance_id(),
                current
            )));
        }

        let results = join_all(deployments.iter().map(|(app, handle)| async move {
            (app.as_str(), self.deployer.poll(handle).await)
        }))
        .await;

        let mut observed = Vec::with_capacity(results.len());
        let mut failure: Option<String> = None;

        for (app, result) in results {
            let status = match result {
                Ok(status) => status,
                Err(DeployerError::Transient(reason)) => {
                    warn!(
                        instance_id = %context.instance_id(),
                        app = app,
                        reason = %reason,
                        "Transient deployer failure while polling"
                    );
                    return Err(ProvisioningError::DeployerTransient(format!("{}: {}", app, reason)));
                }
                Err(DeployerError::Permanent(reason)) => DeploymentStatus::Failed { reason },
            };

            trace!(instance_id = %context.instance_id(), app = app, status = ?status, "Polled deployment");
            if let DeploymentStatus::Failed { reason } = &status {
                failure.get_or_insert_with(|| format!("{}: {}", app, reason));
            }
            observed.push(current.observe(&status));
        }

        let aggregate = BackingAppState::aggregate(observed).ok_or_else(|| {
            ProvisioningError::InternalConsistency("no deployment states to aggregate".to_string())
        })?;
        context.apply_observation(aggregate)?;

        match context.backing_app_state() {
            BackingAppState::Deployed => Ok(PollProgress::Settled),
            BackingAppState::Failed => {
                context.record_failure(
                    failure.unwrap_or_else(|| "backing application deployment failed".to_string()),
                );
                self.persist(context).await?;
                Ok(PollProgress::Settled)
            }
            state => {
                debug!(instance_id = %context.instance_id(), state = %state, "Deployment still in progress");
                self.persist(context).await?;
                Ok(PollProgress::InProgress)
            }
        }
    }

    /// Step 4: persist the terminal state and mark the instance provisioned
    async fn finalize(&self, context: &mut RequestContext) -> Result<ProvisioningOutcome> {
        if !context.is_provisioned() {
            context.mark_provisioned();
            self.persist(context).await?;
            info!(instance_id = %context.instance_id(), "Service instance provisioned");
        }

        Ok(ProvisioningOutcome::Created {
            operation: context.operation().clone(),
        })
    }

    async fn persist(&self, context: &mut RequestContext) -> Result<()> {
        context.touch();
        self.store.put(context.record()).await?;
        self.publish(context).await;
        Ok(())
    }

    /// Events are only handed out after the write they describe succeeded
    async fn publish(&self, context: &mut RequestContext) {
        for event in context.take_events() {
            let event_type = event.event_type();
            if let Err(err) = self.event_handler.handle_event(event).await {
                warn!(event_type = event_type, error = %err, "Domain event handler failed");
            }
        }
    }
}

fn require_manifests(
    manifests: Option<&ResolvedManifests>,
    step: WorkflowStep,
) -> Result<&ResolvedManifests> {
    manifests.ok_or_else(|| {
        ProvisioningError::InternalConsistency(format!("{:?} selected without resolved manifests", step))
    })
}

/// Record every handle the deployer returned. The first permanent failure
/// wins over transient ones.
fn absorb_handles(
    context: &mut RequestContext,
    results: DeployResults,
) -> (Vec<String>, Option<DeployerError>) {
    let mut acknowledged = Vec::with_capacity(results.len());
    let mut permanent = None;
    let mut transient = None;

    for (app, result) in results {
        match result {
            Ok(handle) => {
                context.record_deployment(app.clone(), handle);
                acknowledged.push(app);
            }
            Err(DeployerError::Permanent(reason)) => {
                permanent.get_or_insert_with(|| DeployerError::Permanent(format!("{}: {}", app, reason)));
            }
            Err(DeployerError::Transient(reason)) => {
                transient.get_or_insert_with(|| DeployerError::Transient(format!("{}: {}", app, reason)));
            }
        }
    }

    (acknowledged, permanent.or(transient))
}

fn log_result(instance_id: &InstanceId, result: &Result<ProvisioningOutcome>) {
    match result {
        Ok(ProvisioningOutcome::Created { .. }) => {
            info!(instance_id = %instance_id, "Provisioning complete")
        }
        Ok(ProvisioningOutcome::Accepted { operation }) => {
            debug!(instance_id = %instance_id, operation = %operation, "Provisioning in progress")
        }
        Err(err) if err.is_retryable() => {
            warn!(instance_id = %instance_id, error = %err, "Provisioning interrupted, retry is safe")
        }
        Err(ProvisioningError::InternalConsistency(msg)) => {
            tracing::error!(instance_id = %instance_id, error = %msg, "Provisioning aborted by inconsistent state")
        }
        Err(err) => info!(instance_id = %instance_id, error = %err, "Provisioning ended with an error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::memory::{
        MemoryInstanceStateStore, ScriptedDeployer, StaticManifestResolver,
    };
    use crate::domain::repository::MockBackingAppDeployer;
    use std::sync::Mutex;

    /// Event handler that records event types
    #[derive(Default)]
    struct RecordingEventHandler {
        events: Mutex<Vec<&'static str>>,
    }

    impl RecordingEventHandler {
        fn event_types(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DomainEventHandler for RecordingEventHandler {
        async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<()> {
            self.events.lock().unwrap().push(event.event_type());
            Ok(())
        }
    }

    fn request(plan: &str) -> CreationRequest {
        CreationRequest::new("svc-123", "database", plan)
    }

    fn service_with(
        store: Arc<MemoryInstanceStateStore>,
        deployer: Arc<dyn BackingAppDeployer>,
    ) -> ProvisioningService {
        ProvisioningService::new(
            store,
            deployer,
            Arc::new(StaticManifestResolver::new(&[("db", "file:///apps/db.jar")])),
            Arc::new(LoggingEventHandler),
        )
    }

    fn handle_for(manifest: &BackingAppManifest) -> DeploymentHandle {
        DeploymentHandle(format!("{}-handle", manifest.deployment_name))
    }

    #[test]
    fn test_dispatch_table() {
        let mut record = InstanceRecord::new(request("P1"), OperationId("op".to_string()));
        let fresh = RequestContext::fresh(request("P1"), OperationId("op".to_string()));
        assert_eq!(WorkflowStep::select(&fresh, None), WorkflowStep::Deploy);

        record.state = BackingAppState::NotDeployed;
        let existing = RequestContext::rehydrate(record.clone());
        assert_eq!(WorkflowStep::select(&existing, None), WorkflowStep::Deploy);

        record.state = BackingAppState::Deploying;
        let deploying = RequestContext::rehydrate(record.clone());
        assert_eq!(WorkflowStep::select(&deploying, None), WorkflowStep::Poll);

        record.state = BackingAppState::Deployed;
        let deployed = RequestContext::rehydrate(record.clone());
        assert_eq!(WorkflowStep::select(&deployed, None), WorkflowStep::Finalize);

        record.state = BackingAppState::Failed;
        let failed = RequestContext::rehydrate(record);
        assert_eq!(WorkflowStep::select(&failed, None), WorkflowStep::ReportFailure);
    }

    #[test]
    fn test_dispatch_detects_changed_manifests() {
        let manifests = vec![BackingAppManifest::new("svc-123", "db", "file:///db-v2.jar")];
        let resolved = ResolvedManifests {
            digest: manifest_digest(&manifests).unwrap(),
            manifests,
        };

        let mut record = InstanceRecord::new(request("P1"), OperationId("op".to_string()));
        record.state = BackingAppState::Deploying;
        record.manifest_digest = Some("old-digest".to_string());
        record
            .deployments
            .insert("db".to_string(), DeploymentHandle("h".to_string()));
        let context = RequestContext::rehydrate(record.clone());
        assert_eq!(WorkflowStep::select(&context, Some(&resolved)), WorkflowStep::Update);

        record.manifest_digest = Some(resolved.digest.clone());
        let context = RequestContext::rehydrate(record);
        assert_eq!(WorkflowStep::select(&context, Some(&resolved)), WorkflowStep::Poll);
    }

    #[tokio::test]
    async fn test_transient_deploy_failure_leaves_store_untouched() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        let mut deployer = MockBackingAppDeployer::new();
        let mut attempts = 0;
        deployer.expect_deploy().times(2).returning(move |manifest| {
            attempts += 1;
            if attempts == 1 {
                Err(DeployerError::Transient("503 from platform".to_string()))
            } else {
                Ok(handle_for(manifest))
            }
        });
        deployer
            .expect_poll()
            .times(1)
            .returning(|_| Ok(DeploymentStatus::Pending));
        let service = service_with(store.clone(), Arc::new(deployer));

        let first = service.create_service_instance(request("P1")).await;
        assert!(matches!(first, Err(ProvisioningError::DeployerTransient(_))));
        let stored = store.snapshot("svc-123").unwrap();
        assert_eq!(stored.state, BackingAppState::NotDeployed);
        assert!(stored.deployments.is_empty());

        let second = service.create_service_instance(request("P1")).await.unwrap();
        assert!(matches!(second, ProvisioningOutcome::Accepted { .. }));
        assert_eq!(
            store.snapshot("svc-123").unwrap().state,
            BackingAppState::DeployRequested
        );
    }

    #[tokio::test]
    async fn test_permanent_deploy_failure_is_terminal() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        let mut deployer = MockBackingAppDeployer::new();
        deployer
            .expect_deploy()
            .times(1)
            .returning(|_| Err(DeployerError::Permanent("invalid artifact".to_string())));
        deployer.expect_poll().never();
        let service = service_with(store.clone(), Arc::new(deployer));

        let result = service.create_service_instance(request("P1")).await;
        assert_eq!(
            result,
            Err(ProvisioningError::DeployerPermanent("db: invalid artifact".to_string()))
        );

        let stored = store.snapshot("svc-123").unwrap();
        assert_eq!(stored.state, BackingAppState::Failed);
        assert_eq!(stored.failure.as_deref(), Some("db: invalid artifact"));

        // Same payload again reports the same terminal failure without a deploy
        let again = service.create_service_instance(request("P1")).await;
        assert_eq!(again, result);
    }

    #[tokio::test]
    async fn test_transient_poll_failure_keeps_state() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        let mut deployer = MockBackingAppDeployer::new();
        deployer
            .expect_deploy()
            .times(1)
            .returning(|manifest| Ok(handle_for(manifest)));
        let mut polls = 0;
        deployer.expect_poll().times(2).returning(move |_| {
            polls += 1;
            if polls == 1 {
                Ok(DeploymentStatus::InProgress)
            } else {
                Err(DeployerError::Transient("connection reset".to_string()))
            }
        });
        let service = service_with(store.clone(), Arc::new(deployer));
        let instance_id = InstanceId("svc-123".to_string());

        service.create_service_instance(request("P1")).await.unwrap();
        assert_eq!(store.snapshot("svc-123").unwrap().state, BackingAppState::Deploying);

        let result = service.last_operation(&instance_id).await;
        assert!(matches!(result, Err(ProvisioningError::DeployerTransient(_))));
        assert_eq!(store.snapshot("svc-123").unwrap().state, BackingAppState::Deploying);
    }

    #[tokio::test]
    async fn test_store_unavailable_makes_no_deployer_call() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        store.set_unavailable(true);
        let mut deployer = MockBackingAppDeployer::new();
        deployer.expect_deploy().never();
        deployer.expect_poll().never();
        let service = service_with(store.clone(), Arc::new(deployer));

        let result = service.create_service_instance(request("P1")).await;

        assert!(matches!(result, Err(ProvisioningError::StoreUnavailable(_))));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_of_unknown_instance() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        let service = service_with(store, Arc::new(ScriptedDeployer::new()));

        let result = service.last_operation(&InstanceId("missing".to_string())).await;

        assert_eq!(
            result,
            Err(ProvisioningError::InstanceNotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_events_follow_the_lifecycle() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        let deployer = Arc::new(ScriptedDeployer::new());
        deployer.script_polls(
            "db",
            vec![DeploymentStatus::InProgress, DeploymentStatus::Succeeded],
        );
        let handler = Arc::new(RecordingEventHandler::default());
        let service = ProvisioningService::new(
            store,
            deployer,
            Arc::new(StaticManifestResolver::new(&[("db", "file:///db.jar")])),
            handler.clone(),
        );

        service.create_service_instance(request("P1")).await.unwrap();
        let outcome = service
            .last_operation(&InstanceId("svc-123".to_string()))
            .await
            .unwrap();

        assert!(matches!(outcome, ProvisioningOutcome::Created { .. }));
        assert_eq!(
            handler.event_types(),
            vec![
                "service_instance.creation_requested",
                "backing_apps.state_advanced",
                "backing_apps.deploy_requested",
                "backing_apps.state_advanced",
                "backing_apps.state_advanced",
                "service_instance.provisioned",
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_creates_deploy_once() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        let deployer = Arc::new(ScriptedDeployer::new());
        let service = service_with(store, deployer.clone());

        let (first, second) = tokio::join!(
            service.create_service_instance(request("P1")),
            service.create_service_instance(request("P1")),
        );

        assert!(matches!(first, Ok(ProvisioningOutcome::Accepted { .. })));
        assert!(matches!(second, Ok(ProvisioningOutcome::Accepted { .. })));
        assert_eq!(deployer.deploy_calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_manifest_set_is_rejected() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        let deployer = Arc::new(ScriptedDeployer::new());
        let service = ProvisioningService::new(
            store.clone(),
            deployer.clone(),
            Arc::new(StaticManifestResolver::new(&[])),
            Arc::new(LoggingEventHandler),
        );

        let result = service.create_service_instance(request("P1")).await;

        assert!(matches!(result, Err(ProvisioningError::ManifestResolution(_))));
        assert_eq!(deployer.deploy_calls(), 0);
        assert!(store.snapshot("svc-123").is_none());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_waits_for_a_usable_plan() {
        let store = Arc::new(MemoryInstanceStateStore::new());
        store.set_allow_reset(true);
        let mut failed = InstanceRecord::new(request("P1"), OperationId("op-failed".to_string()));
        failed.state = BackingAppState::Failed;
        failed.failure = Some("db: out of memory".to_string());
        store.insert(failed.clone());

        let service = ProvisioningService::new(
            store.clone(),
            Arc::new(ScriptedDeployer::new()),
            Arc::new(StaticManifestResolver::new(&[])),
            Arc::new(LoggingEventHandler),
        );

        let result = service.create_service_instance(request("P1")).await;

        assert!(matches!(result, Err(ProvisioningError::ManifestResolution(_))));
        assert_eq!(store.snapshot("svc-123"), Some(failed));
    }
}
