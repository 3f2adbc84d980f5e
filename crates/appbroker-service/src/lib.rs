//!
//! App Broker Service - Service broker provisioning backing applications
//!
//! This crate wires configuration, the plan catalog, the state store and the
//! deployer into the provisioning workflow and exposes the broker entry points.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Broker entry points
pub mod broker;

/// Plan catalog and manifest resolution
pub mod catalog;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Broker factory module
pub mod server_factory;

// Re-export key types
pub use broker::AppBroker;
pub use catalog::{ConfiguredManifestResolver, ServiceCatalog};
pub use config::BrokerConfig;
pub use error::{ServiceError, ServiceResult};
pub use server_factory::{create_broker, create_broker_with};

use appbroker_monitoring::MonitoringConfig;

/// Monitoring settings derived from the broker configuration
pub fn monitoring_config(config: &BrokerConfig) -> MonitoringConfig {
    MonitoringConfig {
        service_name: "appbroker".to_string(),
        log_filter: config.log_filter.clone(),
        enable_json_logging: config.json_logs,
        enable_metrics: config.enable_metrics,
    }
}
