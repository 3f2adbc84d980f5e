//! Broker entry points
//!
//! The two inbound operations of the broker: creating a service instance and
//! polling its last operation. Both answer with a [`StatusReport`].

use std::time::Instant;
use tracing::{info, instrument};

use appbroker_core::{
    CreationRequest, InstanceId, InstanceRecord, ProvisioningOutcome, ProvisioningService,
    StatusReport,
};
use appbroker_monitoring::ProvisioningMetrics;

use crate::error::ServiceResult;

/// Metrics label of the create entry point
pub const ENTRY_CREATE: &str = "create";

/// Metrics label of the last-operation entry point
pub const ENTRY_LAST_OPERATION: &str = "last_operation";

/// Service broker facade over the provisioning workflow
#[derive(Clone)]
pub struct AppBroker {
    service: ProvisioningService,
    metrics: ProvisioningMetrics,
}

impl AppBroker {
    /// Create a broker
    pub fn new(service: ProvisioningService, metrics: ProvisioningMetrics) -> Self {
        Self { service, metrics }
    }

    /// Handle a create-service-instance call
    #[instrument(skip_all, fields(instance_id = %request.instance_id()))]
    pub async fn create_service_instance(&self, request: CreationRequest) -> StatusReport {
        let started = Instant::now();
        let result = self.service.create_service_instance(request).await;
        self.finish(ENTRY_CREATE, &result, started)
    }

    /// Handle a last-operation poll
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn last_operation(&self, instance_id: &InstanceId) -> StatusReport {
        let started = Instant::now();
        let result = self.service.last_operation(instance_id).await;
        self.finish(ENTRY_LAST_OPERATION, &result, started)
    }

    /// Stored record of an instance
    pub async fn instance_record(&self, instance_id: &InstanceId) -> ServiceResult<Option<InstanceRecord>> {
        Ok(self.service.instance_record(instance_id).await?)
    }

    fn finish(
        &self,
        entry: &str,
        result: &appbroker_core::Result<ProvisioningOutcome>,
        started: Instant,
    ) -> StatusReport {
        let report = StatusReport::from_result(result);
        self.metrics
            .record_invocation(entry, outcome_label(&report), started.elapsed());
        self.service.locks().prune();

        info!(
            entry = entry,
            status = report.http_status(),
            state = report.operation_state(),
            "Answered broker call"
        );
        report
    }
}

/// Metrics label for a report
pub fn outcome_label(report: &StatusReport) -> &'static str {
    match report {
        StatusReport::Created { .. } => "created",
        StatusReport::Accepted { .. } => "accepted",
        StatusReport::Conflict { .. } => "conflict",
        StatusReport::Failed { .. } => "failed",
        StatusReport::Gone { .. } => "gone",
        StatusReport::Unavailable { .. } => "unavailable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appbroker_core::{
        domain::repository::memory::{MemoryInstanceStateStore, StaticManifestResolver},
        BackingAppDeployer, BackingAppManifest, DeployerError, DeploymentHandle, DeploymentStatus,
        LoggingEventHandler,
    };
    use appbroker_monitoring::{MetricType, MetricsCollector};
    use async_trait::async_trait;
    use mockall::mock;
    use std::sync::{Arc, Mutex};

    mock! {
        Deployer {}

        #[async_trait]
        impl BackingAppDeployer for Deployer {
            async fn deploy(&self, manifest: &BackingAppManifest) -> Result<DeploymentHandle, DeployerError>;
            async fn update(
                &self,
                handle: &DeploymentHandle,
                manifest: &BackingAppManifest,
            ) -> Result<DeploymentHandle, DeployerError>;
            async fn poll(&self, handle: &DeploymentHandle) -> Result<DeploymentStatus, DeployerError>;
        }
    }

    #[derive(Default)]
    struct OutcomeCollector {
        outcomes: Mutex<Vec<String>>,
    }

    impl MetricsCollector for OutcomeCollector {
        fn record_metric(&self, _name: &str, _value: f64, metric_type: MetricType, labels: &[(String, String)]) {
            if metric_type != MetricType::Counter {
                return;
            }
            if let Some((_, outcome)) = labels.iter().find(|(key, _)| key == "outcome") {
                self.outcomes.lock().unwrap().push(outcome.clone());
            }
        }
    }

    fn init_test_tracing() {
        use tracing_subscriber::{fmt, EnvFilter};
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(EnvFilter::from_default_env().add_directive("appbroker_service=debug".parse().unwrap()))
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    fn broker(deployer: MockDeployer, collector: Arc<OutcomeCollector>) -> AppBroker {
        let service = ProvisioningService::new(
            Arc::new(MemoryInstanceStateStore::new()),
            Arc::new(deployer),
            Arc::new(StaticManifestResolver::new(&[("db", "file:///db.jar")])),
            Arc::new(LoggingEventHandler),
        );
        AppBroker::new(service, ProvisioningMetrics::new(collector))
    }

    #[tokio::test]
    async fn test_transient_deployer_failure_is_unavailable() {
        init_test_tracing();
        let mut deployer = MockDeployer::new();
        deployer
            .expect_deploy()
            .times(1)
            .returning(|_| Err(DeployerError::Transient("platform restarting".to_string())));
        let collector = Arc::new(OutcomeCollector::default());
        let broker = broker(deployer, collector.clone());

        let report = broker
            .create_service_instance(CreationRequest::new("svc-1", "database", "P1"))
            .await;

        assert_eq!(report.http_status(), 503);
        assert_eq!(report.operation_state(), "in progress");
        assert_eq!(*collector.outcomes.lock().unwrap(), vec!["unavailable".to_string()]);
    }

    #[tokio::test]
    async fn test_reports_and_metrics_for_each_call() {
        let mut deployer = MockDeployer::new();
        deployer
            .expect_deploy()
            .times(1)
            .returning(|m| Ok(DeploymentHandle(format!("{}-1", m.deployment_name))));
        deployer
            .expect_poll()
            .times(1)
            .returning(|_| Ok(DeploymentStatus::Succeeded));
        let collector = Arc::new(OutcomeCollector::default());
        let broker = broker(deployer, collector.clone());

        let created = broker
            .create_service_instance(CreationRequest::new("svc-1", "database", "P1"))
            .await;
        let conflict = broker
            .create_service_instance(CreationRequest::new("svc-1", "database", "P2"))
            .await;
        let gone = broker.last_operation(&InstanceId("svc-2".to_string())).await;

        assert_eq!(created.http_status(), 201);
        assert_eq!(conflict.http_status(), 409);
        assert_eq!(gone.http_status(), 410);
        assert_eq!(
            *collector.outcomes.lock().unwrap(),
            vec!["created".to_string(), "conflict".to_string(), "gone".to_string()]
        );
    }

    #[tokio::test]
    async fn test_locks_are_pruned_after_calls() {
        let deployer = MockDeployer::new();
        let broker = broker(deployer, Arc::new(OutcomeCollector::default()));

        broker.last_operation(&InstanceId("svc-1".to_string())).await;

        assert!(broker.service.locks().is_empty());
    }
}
