//! Monitoring module for the App Broker.
//!
//! Structured logging setup and provisioning metrics.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log level filter (e.g., "info,appbroker_core=debug")
    pub log_filter: String,
    /// JSON output for log aggregation instead of pretty output
    pub enable_json_logging: bool,
    /// Record provisioning metrics
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "appbroker".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            enable_metrics: true,
        }
    }
}

// Exported types
pub use crate::logging::{init_logging, init_test_logging};
pub use crate::metrics::{
    FacadeMetricsCollector, MetricType, MetricsCollector, NoopMetricsCollector,
    ProvisioningMetrics,
};
