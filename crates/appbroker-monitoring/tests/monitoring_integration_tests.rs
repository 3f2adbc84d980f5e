use appbroker_monitoring::{
    metrics::{PROVISION_DURATION_MS, PROVISION_REQUESTS_TOTAL},
    MetricType, MetricsCollector, MonitoringConfig, ProvisioningMetrics,
};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Collector that keeps every recorded metric
#[derive(Default)]
struct RecordingCollector {
    metrics: Mutex<Vec<(String, f64, MetricType, Vec<(String, String)>)>>,
}

impl RecordingCollector {
    fn recorded(&self) -> Vec<(String, f64, MetricType, Vec<(String, String)>)> {
        self.metrics.lock().unwrap().clone()
    }
}

impl MetricsCollector for RecordingCollector {
    fn record_metric(&self, name: &str, value: f64, metric_type: MetricType, labels: &[(String, String)]) {
        self.metrics
            .lock()
            .unwrap()
            .push((name.to_string(), value, metric_type, labels.to_vec()));
    }
}

fn label(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

#[test]
fn test_invocations_accumulate_per_entry() {
    let collector = Arc::new(RecordingCollector::default());
    let metrics = ProvisioningMetrics::new(collector.clone());

    metrics.record_invocation("create", "accepted", Duration::from_millis(12));
    metrics.record_invocation("last_operation", "created", Duration::from_millis(4));

    let recorded = collector.recorded();
    assert_eq!(recorded.len(), 4);
    assert_eq!(
        recorded[0],
        (
            PROVISION_REQUESTS_TOTAL.to_string(),
            1.0,
            MetricType::Counter,
            vec![label("entry", "create"), label("outcome", "accepted")],
        )
    );
    assert_eq!(recorded[1].0, PROVISION_DURATION_MS);
    assert_eq!(recorded[1].2, MetricType::Histogram);
    assert_eq!(recorded[3].3, vec![label("entry", "last_operation")]);
}

#[test]
fn test_clones_share_the_collector() {
    let collector = Arc::new(RecordingCollector::default());
    let metrics = ProvisioningMetrics::new(collector.clone());
    let clone = metrics.clone();

    metrics.record_invocation("create", "conflict", Duration::ZERO);
    clone.record_invocation("create", "conflict", Duration::ZERO);

    assert_eq!(collector.recorded().len(), 4);
}

#[test]
fn test_monitoring_config_overrides() {
    let config = MonitoringConfig {
        enable_json_logging: true,
        ..MonitoringConfig::default()
    };

    assert!(config.enable_json_logging);
    assert_eq!(config.service_name, "appbroker");
}
