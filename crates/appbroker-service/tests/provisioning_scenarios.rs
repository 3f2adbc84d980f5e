use std::sync::Arc;

use appbroker_core::{BackingAppState, CreationRequest, InstanceId, StatusReport};
use appbroker_service::{create_broker, create_broker_with, BrokerConfig};
use appbroker_state_inmemory::{InMemoryStateStoreProvider, ResetPolicy, SimulatedDeployer};
use pretty_assertions::assert_eq;
use serde_json::json;

const CATALOG: &str = r#"
enable_metrics: false
simulated_polls_until_ready: 2
services:
  - id: database
    plans:
      - id: small
        apps:
          - name: db
            path: "file:///apps/db.jar"
            environment:
              - name: POOL_SIZE
                value: 5
      - id: large
        apps:
          - name: db
            path: "file:///apps/db.jar"
          - name: admin
            path: "file:///apps/admin.jar"
"#;

fn config() -> BrokerConfig {
    BrokerConfig::from_yaml(CATALOG).unwrap()
}

fn instance(id: &str) -> InstanceId {
    InstanceId(id.to_string())
}

#[tokio::test]
async fn test_create_then_poll_until_created() {
    appbroker_monitoring::init_test_logging();
    let broker = create_broker(&config()).unwrap();

    let accepted = broker
        .create_service_instance(CreationRequest::new("svc-1", "database", "small"))
        .await;
    assert_eq!(accepted.http_status(), 202);
    assert!(!accepted.is_terminal());

    let created = broker.last_operation(&instance("svc-1")).await;
    assert_eq!(created.http_status(), 201);
    assert_eq!(created.operation_state(), "succeeded");

    // The operation token stays the same across the whole provisioning
    match (accepted, created) {
        (StatusReport::Accepted { operation: first }, StatusReport::Created { operation: last }) => {
            assert_eq!(first, last)
        }
        other => panic!("unexpected reports {:?}", other),
    }

    let record = broker.instance_record(&instance("svc-1")).await.unwrap().unwrap();
    assert_eq!(record.state, BackingAppState::Deployed);
    assert!(record.provisioned);
}

#[tokio::test]
async fn test_plan_with_two_apps_deploys_both() {
    let broker = create_broker(&config()).unwrap();

    broker
        .create_service_instance(CreationRequest::new("svc-2", "database", "large"))
        .await;
    let report = broker.last_operation(&instance("svc-2")).await;

    assert_eq!(report.http_status(), 201);
    let record = broker.instance_record(&instance("svc-2")).await.unwrap().unwrap();
    let mut apps: Vec<&str> = record.deployments.keys().map(String::as_str).collect();
    apps.sort_unstable();
    assert_eq!(apps, vec!["admin", "db"]);
}

#[tokio::test]
async fn test_repeated_create_is_idempotent_and_conflicts_are_rejected() {
    let broker = create_broker(&config()).unwrap();
    let request = CreationRequest::new("svc-3", "database", "small").with_parameter("tier", json!("gold"));

    let first = broker.create_service_instance(request.clone()).await;
    let second = broker.create_service_instance(request.clone()).await;
    assert_eq!(first.http_status(), 202);
    assert_eq!(second.http_status(), 201);

    let repeated = broker.create_service_instance(request).await;
    assert_eq!(repeated, second);

    let other_plan = broker
        .create_service_instance(CreationRequest::new("svc-3", "database", "large"))
        .await;
    assert_eq!(other_plan.http_status(), 409);
    assert_eq!(other_plan.operation_state(), "failed");
}

#[tokio::test]
async fn test_unknown_plan_and_unknown_instance() {
    let broker = create_broker(&config()).unwrap();

    let unknown_plan = broker
        .create_service_instance(CreationRequest::new("svc-4", "database", "huge"))
        .await;
    assert!(matches!(unknown_plan, StatusReport::Failed { .. }));
    assert_eq!(unknown_plan.http_status(), 500);

    let gone = broker.last_operation(&instance("svc-missing")).await;
    assert!(matches!(gone, StatusReport::Gone { .. }));
    assert_eq!(gone.http_status(), 410);
}

#[tokio::test]
async fn test_rejected_plan_does_not_reserve_the_instance_id() {
    let broker = create_broker(&config()).unwrap();

    let rejected = broker
        .create_service_instance(CreationRequest::new("svc-7", "database", "huge"))
        .await;
    assert_eq!(rejected.http_status(), 500);
    assert!(broker.instance_record(&instance("svc-7")).await.unwrap().is_none());

    let corrected = broker
        .create_service_instance(CreationRequest::new("svc-7", "database", "small"))
        .await;
    assert_eq!(corrected.http_status(), 202);
}

#[tokio::test]
async fn test_failed_instance_can_be_recreated_when_reset_is_allowed() {
    let config = BrokerConfig {
        reset_failed_instances: true,
        ..config()
    };
    let provider = InMemoryStateStoreProvider::new().with_reset_policy(ResetPolicy::from(config.reset_failed_instances));

    let failing = create_broker_with(
        &config,
        provider.create_store(),
        Arc::new(SimulatedDeployer::new(1).with_failing_app("db", "disk quota exceeded")),
    )
    .unwrap();
    let failed = failing
        .create_service_instance(CreationRequest::new("svc-5", "database", "small"))
        .await;
    assert_eq!(
        failed,
        StatusReport::Failed {
            reason: "db: disk quota exceeded".to_string()
        }
    );

    let healthy = create_broker_with(&config, provider.create_store(), Arc::new(SimulatedDeployer::new(1))).unwrap();
    let recreated = healthy
        .create_service_instance(CreationRequest::new("svc-5", "database", "small"))
        .await;

    assert_eq!(recreated.http_status(), 201);
    let record = healthy.instance_record(&instance("svc-5")).await.unwrap().unwrap();
    assert_eq!(record.state, BackingAppState::Deployed);
}

#[tokio::test]
async fn test_failed_instance_stays_failed_without_reset() {
    let config = config();
    let provider = InMemoryStateStoreProvider::new();
    let broker = create_broker_with(
        &config,
        provider.create_store(),
        Arc::new(SimulatedDeployer::new(1).with_failing_app("db", "disk quota exceeded")),
    )
    .unwrap();
    let request = CreationRequest::new("svc-6", "database", "small");

    let first = broker.create_service_instance(request.clone()).await;
    let second = broker.create_service_instance(request).await;
    let polled = broker.last_operation(&instance("svc-6")).await;

    assert_eq!(first.http_status(), 500);
    assert_eq!(second, first);
    assert_eq!(polled, first);
}
