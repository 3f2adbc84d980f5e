//! Configuration for the App Broker
//!
//! Loaded from an optional YAML file followed by `APPBROKER_*` environment
//! variables. Nested keys use `__`, e.g. `APPBROKER_LOG_FILTER` or
//! `APPBROKER_SERVICES__0__ID`.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::net::SocketAddr;
use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "APPBROKER_CONFIG_FILE";

/// Configuration file used when none is named
pub const DEFAULT_CONFIG_FILE: &str = "appbroker.yaml";

/// Only supported state store scheme
pub const MEMORY_STORE_SCHEME: &str = "memory://";

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Log filter directives
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// JSON log output
    #[serde(default)]
    pub json_logs: bool,

    /// URL of the instance state store
    #[serde(default = "default_state_store_url")]
    pub state_store_url: String,

    /// Let a new creation call discard a failed instance
    #[serde(default)]
    pub reset_failed_instances: bool,

    /// Polls before a simulated deployment completes
    #[serde(default = "default_polls_until_ready")]
    pub simulated_polls_until_ready: u32,

    /// Record provisioning metrics
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,

    /// Address to serve Prometheus metrics on
    #[serde(default)]
    pub metrics_listen: Option<String>,

    /// Catalog of services, their plans and backing apps
    #[serde(default)]
    pub services: Vec<ServiceOffering>,
}

/// A service in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    /// Service id as sent by the marketplace
    pub id: String,

    /// Plans of the service
    #[serde(default)]
    pub plans: Vec<PlanConfig>,
}

/// A plan and the backing apps it deploys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Plan id as sent by the marketplace
    pub id: String,

    /// Backing apps, deployed in this order
    #[serde(default)]
    pub apps: Vec<BackingAppConfig>,
}

/// One backing application of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackingAppConfig {
    /// App name, unique within the plan
    pub name: String,

    /// Artifact location
    pub path: String,

    /// Deployer properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Base environment; request parameters override it
    #[serde(default)]
    pub environment: Vec<EnvironmentVariable>,
}

/// Environment variable of a backing app. Kept as a list because
/// configuration keys are case-folded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    /// Variable name
    pub name: String,

    /// Variable value
    pub value: Value,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_state_store_url() -> String {
    "memory://local".to_string()
}

fn default_polls_until_ready() -> u32 {
    3
}

fn default_enable_metrics() -> bool {
    true
}

impl BrokerConfig {
    /// Load configuration from the configured file and the environment
    pub fn load() -> ServiceResult<Self> {
        let path = env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    /// Load configuration from a file (if it exists) and the environment
    pub fn load_from(path: &str) -> ServiceResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("APPBROKER")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config = Self::build(builder)?;
        info!(path = path, services = config.services.len(), "Loaded broker configuration");
        Ok(config)
    }

    /// Parse configuration from YAML text, without the environment
    pub fn from_yaml(yaml: &str) -> ServiceResult<Self> {
        Self::build(Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)))
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> ServiceResult<Self> {
        let config: BrokerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the broker cannot run with
    pub fn validate(&self) -> ServiceResult<()> {
        if !self.state_store_url.starts_with(MEMORY_STORE_SCHEME) {
            return Err(ServiceError::UnsupportedStore(self.state_store_url.clone()));
        }

        if self.simulated_polls_until_ready == 0 {
            return Err(ServiceError::ConfigError(
                "simulated_polls_until_ready must be at least 1".to_string(),
            ));
        }

        self.metrics_listen_addr()?;

        let mut plans = HashSet::new();
        for service in &self.services {
            if service.id.trim().is_empty() {
                return Err(ServiceError::ConfigError("Service id must not be empty".to_string()));
            }
            if service.plans.is_empty() {
                return Err(ServiceError::ConfigError(format!(
                    "Service {} has no plans",
                    service.id
                )));
            }

            for plan in &service.plans {
                if plan.id.trim().is_empty() {
                    return Err(ServiceError::ConfigError(format!(
                        "Service {} has a plan without id",
                        service.id
                    )));
                }
                if !plans.insert((service.id.as_str(), plan.id.as_str())) {
                    return Err(ServiceError::ConfigError(format!(
                        "Duplicate plan {} for service {}",
                        plan.id, service.id
                    )));
                }
                validate_apps(&service.id, plan)?;
            }
        }

        if self.services.is_empty() {
            warn!("No services configured - every creation request will fail");
        }

        Ok(())
    }

    /// Parsed metrics listen address, if any
    pub fn metrics_listen_addr(&self) -> ServiceResult<Option<SocketAddr>> {
        self.metrics_listen
            .as_deref()
            .map(|listen| {
                listen.parse::<SocketAddr>().map_err(|e| {
                    ServiceError::ConfigError(format!("Invalid metrics_listen '{}': {}", listen, e))
                })
            })
            .transpose()
    }
}

fn validate_apps(service_id: &str, plan: &PlanConfig) -> ServiceResult<()> {
    if plan.apps.is_empty() {
        return Err(ServiceError::ConfigError(format!(
            "Plan {} of service {} has no backing apps",
            plan.id, service_id
        )));
    }

    let mut names = HashSet::new();
    for app in &plan.apps {
        if app.name.trim().is_empty() || app.path.trim().is_empty() {
            return Err(ServiceError::ConfigError(format!(
                "Plan {} of service {} has an app without name or path",
                plan.id, service_id
            )));
        }
        if !names.insert(app.name.as_str()) {
            return Err(ServiceError::ConfigError(format!(
                "Duplicate app {} in plan {} of service {}",
                app.name, plan.id, service_id
            )));
        }
    }

    Ok(())
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json_logs: false,
            state_store_url: default_state_store_url(),
            reset_failed_instances: false,
            simulated_polls_until_ready: default_polls_until_ready(),
            enable_metrics: default_enable_metrics(),
            metrics_listen: None,
            services: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CATALOG: &str = r#"
log_filter: "debug"
reset_failed_instances: true
services:
  - id: database
    plans:
      - id: small
        apps:
          - name: db
            path: "file:///apps/db.jar"
            properties:
              memory: "512m"
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

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.state_store_url, "memory://local");
        assert_eq!(config.simulated_polls_until_ready, 3);
        assert!(config.enable_metrics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_catalog_from_yaml() {
        let config = BrokerConfig::from_yaml(CATALOG).unwrap();

        assert_eq!(config.log_filter, "debug");
        assert!(config.reset_failed_instances);
        assert!(!config.json_logs);
        assert_eq!(config.services.len(), 1);

        let plans = &config.services[0].plans;
        assert_eq!(plans[0].apps[0].properties["memory"], "512m");
        assert_eq!(
            plans[0].apps[0].environment,
            vec![EnvironmentVariable {
                name: "POOL_SIZE".to_string(),
                value: serde_json::json!(5),
            }]
        );
        assert_eq!(
            plans[1].apps.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["db", "admin"]
        );
    }

    #[test]
    fn test_unsupported_store_is_rejected() {
        let config = BrokerConfig {
            state_store_url: "postgres://localhost/broker".to_string(),
            ..BrokerConfig::default()
        };

        assert!(matches!(config.validate(), Err(ServiceError::UnsupportedStore(_))));
    }

    #[test]
    fn test_catalog_errors_are_rejected() {
        let duplicate_plan = r#"
services:
  - id: database
    plans:
      - id: small
        apps: [{ name: db, path: "file:///db.jar" }]
      - id: small
        apps: [{ name: db, path: "file:///db.jar" }]
"#;
        let no_apps = r#"
services:
  - id: database
    plans:
      - id: small
"#;
        let duplicate_app = r#"
services:
  - id: database
    plans:
      - id: small
        apps:
          - { name: db, path: "file:///db.jar" }
          - { name: db, path: "file:///db2.jar" }
"#;

        for yaml in [duplicate_plan, no_apps, duplicate_app] {
            assert!(
                matches!(BrokerConfig::from_yaml(yaml), Err(ServiceError::ConfigError(_))),
                "expected rejection of {}",
                yaml
            );
        }
    }

    #[test]
    fn test_metrics_listen_address() {
        let mut config = BrokerConfig {
            metrics_listen: Some("127.0.0.1:9000".to_string()),
            ..BrokerConfig::default()
        };
        assert_eq!(
            config.metrics_listen_addr().unwrap(),
            Some("127.0.0.1:9000".parse().unwrap())
        );

        config.metrics_listen = Some("not an address".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = BrokerConfig::load_from("/nonexistent/appbroker-test.yaml").unwrap();
        assert_eq!(config.state_store_url, BrokerConfig::default().state_store_url);
    }
}
