//! Per-invocation request context
//!
//! A [`RequestContext`] is built at the start of every workflow invocation,
//! either fresh for a first receipt or rehydrated from the stored record, and
//! is handed by exclusive reference to each workflow step. It performs no I/O.

use crate::domain::backing_app::{BackingAppState, DeploymentHandle};
use crate::domain::events::{
    BackingAppStateAdvanced, DomainEvent, InstanceCreationRequested, InstanceProvisioned,
    InstanceProvisioningFailed,
};
use crate::domain::instance::{
    CreationRequest, InstanceId, InstanceRecord, OperationId, PendingUpdate,
};
use crate::error::Result;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

/// State carried through one provisioning invocation
#[derive(Debug)]
pub struct RequestContext {
    record: InstanceRecord,
    instance_existed: bool,
    events: Vec<Box<dyn DomainEvent>>,
}

impl RequestContext {
    /// Context for the first receipt of a request
    pub fn fresh(request: CreationRequest, operation: OperationId) -> Self {
        let instance_id = request.instance_id().clone();
        let mut context = Self {
            record: InstanceRecord::new(request, operation.clone()),
            instance_existed: false,
            events: Vec::with_capacity(4),
        };

        context.record_event(Box::new(InstanceCreationRequested {
            instance_id,
            operation,
            timestamp: Utc::now(),
        }));

        context
    }

    /// Context rebuilt from a stored record
    pub fn rehydrate(record: InstanceRecord) -> Self {
        Self {
            record,
            instance_existed: true,
            events: Vec::with_capacity(4),
        }
    }

    /// Request captured at first receipt
    #[inline]
    pub fn originating_request(&self) -> &CreationRequest {
        &self.record.request
    }

    /// Instance identity
    #[inline]
    pub fn instance_id(&self) -> &InstanceId {
        self.record.instance_id()
    }

    /// Whether a record for this identity existed before this invocation
    #[inline]
    pub fn instance_existed(&self) -> bool {
        self.instance_existed
    }

    /// Current aggregated backing-app state
    #[inline]
    pub fn backing_app_state(&self) -> BackingAppState {
        self.record.state
    }

    /// Replace the backing-app state. Anything the lifecycle does not allow
    /// is an internal consistency error and leaves the context untouched.
    pub fn set_backing_app_state(&mut self, next: BackingAppState) -> Result<()> {
        let current = self.record.state;
        let next = current.transition(next)?;
        self.apply_state(current, next);
        Ok(())
    }

    /// Fold an aggregated deployer observation into the state, ignoring
    /// observations that would move it backwards
    pub fn apply_observation(&mut self, observed: BackingAppState) -> Result<()> {
        let current = self.record.state;
        let next = current.advance(observed)?;
        self.apply_state(current, next);
        Ok(())
    }

    fn apply_state(&mut self, current: BackingAppState, next: BackingAppState) {
        if current == next {
            return;
        }

        self.record.state = next;
        let instance_id = self.instance_id().clone();
        self.record_event(Box::new(BackingAppStateAdvanced {
            instance_id,
            from: current,
            to: next,
            timestamp: Utc::now(),
        }));
    }

    /// Operation token for this instance
    #[inline]
    pub fn operation(&self) -> &OperationId {
        &self.record.operation
    }

    /// Deployment handles keyed by backing app name
    #[inline]
    pub fn deployments(&self) -> &BTreeMap<String, DeploymentHandle> {
        &self.record.deployments
    }

    /// Deployment handle of one backing app
    pub fn deployment(&self, app: &str) -> Option<&DeploymentHandle> {
        self.record.deployments.get(app)
    }

    /// Remember the handle the deployer returned for a backing app
    pub fn record_deployment(&mut self, app: impl Into<String>, handle: DeploymentHandle) {
        self.record.deployments.insert(app.into(), handle);
    }

    /// Digest of the manifests the deployments were last requested with
    pub fn manifest_digest(&self) -> Option<&str> {
        self.record.manifest_digest.as_deref()
    }

    /// Set the manifest digest
    pub fn set_manifest_digest(&mut self, digest: String) {
        self.record.manifest_digest = Some(digest);
    }

    /// Replace the set of apps the deployments are requested for
    pub fn set_planned_apps<I>(&mut self, apps: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.record.planned_apps = apps.into_iter().collect();
    }

    /// Whether some planned app still lacks a deployment handle. With no
    /// plan recorded every app is unrequested.
    pub fn has_unrequested_apps(&self) -> bool {
        self.record.planned_apps.is_empty()
            || self
                .record
                .planned_apps
                .iter()
                .any(|app| !self.record.deployments.contains_key(app))
    }

    /// Progress of an interrupted update
    pub fn pending_update(&self) -> Option<&PendingUpdate> {
        self.record.pending_update.as_ref()
    }

    /// Whether an app was already updated towards the manifest set `digest`
    pub fn updated_towards(&self, digest: &str, app: &str) -> bool {
        self.record
            .pending_update
            .as_ref()
            .map_or(false, |pending| pending.digest == digest && pending.apps.contains(app))
    }

    /// Remember apps acknowledged by an update that did not complete
    pub fn record_pending_update<I>(&mut self, digest: &str, apps: I)
    where
        I: IntoIterator<Item = String>,
    {
        match &mut self.record.pending_update {
            Some(pending) if pending.digest == digest => pending.apps.extend(apps),
            slot => {
                *slot = Some(PendingUpdate {
                    digest: digest.to_string(),
                    apps: apps.into_iter().collect::<BTreeSet<_>>(),
                })
            }
        }
    }

    /// Forget update progress once the whole manifest set is applied
    pub fn clear_pending_update(&mut self) {
        self.record.pending_update = None;
    }

    /// First failure reason, if the instance failed
    pub fn failure(&self) -> Option<&str> {
        self.record.failure.as_deref()
    }

    /// Move to `Failed` and keep the first reason reported
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.set_backing_app_state(BackingAppState::Failed)?;
        self.record_failure(reason);
        Ok(())
    }

    /// Keep the failure reason once the state is `Failed`
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        if self.record.failure.is_some() {
            return;
        }

        let reason = reason.into();
        self.record.failure = Some(reason.clone());
        let instance_id = self.instance_id().clone();
        self.record_event(Box::new(InstanceProvisioningFailed {
            instance_id,
            reason,
            timestamp: Utc::now(),
        }));
    }

    /// Whether the instance was already finalized
    #[inline]
    pub fn is_provisioned(&self) -> bool {
        self.record.provisioned
    }

    /// Mark the instance durably provisioned
    pub fn mark_provisioned(&mut self) {
        if self.record.provisioned {
            return;
        }

        self.record.provisioned = true;
        let instance_id = self.instance_id().clone();
        self.record_event(Box::new(InstanceProvisioned {
            instance_id,
            timestamp: Utc::now(),
        }));
    }

    /// Record snapshot to persist
    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    /// Update the record timestamp before a write
    pub fn touch(&mut self) {
        self.record.touch();
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Get and clear all domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}
