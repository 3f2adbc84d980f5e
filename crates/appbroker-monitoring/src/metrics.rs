//! Provisioning metrics through the `metrics` facade.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Counter of provisioning invocations by entry point and outcome
pub const PROVISION_REQUESTS_TOTAL: &str = "appbroker_provision_requests_total";

/// Histogram of invocation latency by entry point
pub const PROVISION_DURATION_MS: &str = "appbroker_provision_duration_ms";

static DESCRIBED: OnceCell<()> = OnceCell::new();

fn describe_metrics() {
    DESCRIBED.get_or_init(|| {
        metrics::describe_counter!(
            PROVISION_REQUESTS_TOTAL,
            "Create and last-operation calls by outcome"
        );
        metrics::describe_histogram!(
            PROVISION_DURATION_MS,
            metrics::Unit::Milliseconds,
            "Time spent in one provisioning invocation"
        );
    });
}

/// Type of metric for collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    /// Counter metrics accumulate values
    Counter,
    /// Gauge metrics record current values
    Gauge,
    /// Histogram metrics observe distributions
    Histogram,
}

/// Interface for collecting metrics
#[cfg_attr(test, mockall::automock)]
pub trait MetricsCollector: Send + Sync {
    /// Record a metric with the given name, value, type, and labels
    fn record_metric(&self, name: &str, value: f64, metric_type: MetricType, labels: &[(String, String)]);
}

/// Collector forwarding to whatever recorder is installed for the `metrics` crate
#[derive(Debug, Clone, Copy)]
pub struct FacadeMetricsCollector;

impl FacadeMetricsCollector {
    /// Create the collector and register metric descriptions
    pub fn new() -> Self {
        describe_metrics();
        Self
    }
}

impl Default for FacadeMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector for FacadeMetricsCollector {
    fn record_metric(&self, name: &str, value: f64, metric_type: MetricType, labels: &[(String, String)]) {
        let name = name.to_string();
        let labels = labels.to_vec();
        match metric_type {
            MetricType::Counter => metrics::counter!(name, value as u64, &labels),
            MetricType::Gauge => metrics::gauge!(name, value, &labels),
            MetricType::Histogram => metrics::histogram!(name, value, &labels),
        }
    }
}

/// Collector that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn record_metric(&self, _name: &str, _value: f64, _metric_type: MetricType, _labels: &[(String, String)]) {}
}

/// Metrics recorded by the broker entry points
#[derive(Clone)]
pub struct ProvisioningMetrics {
    collector: Arc<dyn MetricsCollector>,
}

impl ProvisioningMetrics {
    /// Record through the given collector
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self { collector }
    }

    /// Record through the `metrics` facade
    pub fn facade() -> Self {
        Self::new(Arc::new(FacadeMetricsCollector::new()))
    }

    /// Record nothing
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopMetricsCollector))
    }

    /// Record one finished invocation of an entry point
    pub fn record_invocation(&self, entry: &str, outcome: &str, elapsed: Duration) {
        let duration_ms = elapsed.as_secs_f64() * 1000.0;

        self.collector.record_metric(
            PROVISION_REQUESTS_TOTAL,
            1.0,
            MetricType::Counter,
            &[
                ("entry".to_string(), entry.to_string()),
                ("outcome".to_string(), outcome.to_string()),
            ],
        );
        self.collector.record_metric(
            PROVISION_DURATION_MS,
            duration_ms,
            MetricType::Histogram,
            &[("entry".to_string(), entry.to_string())],
        );

        debug!(entry = entry, outcome = outcome, duration_ms = duration_ms, "Recorded provisioning metrics");
    }
}

/// Serve metrics in the Prometheus text format on the given address
#[cfg(feature = "prometheus")]
pub fn install_prometheus_exporter(listen: std::net::SocketAddr) -> anyhow::Result<()> {
    use anyhow::Context;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .context("Failed to install Prometheus exporter")?;
    describe_metrics();

    tracing::info!(listen = %listen, "Prometheus exporter listening");
    Ok(())
}
