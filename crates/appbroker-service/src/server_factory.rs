use std::sync::Arc;

use appbroker_core::{
    BackingAppDeployer, InstanceStateStore, LoggingEventHandler, ProvisioningService,
};
use appbroker_monitoring::ProvisioningMetrics;
use appbroker_state_inmemory::{InMemoryStateStoreProvider, ResetPolicy};
use tracing::info;

use crate::broker::AppBroker;
use crate::catalog::{ConfiguredManifestResolver, ServiceCatalog};
use crate::config::BrokerConfig;
use crate::error::ServiceResult;

/// Create a broker with the collaborators named by the configuration
pub fn create_broker(config: &BrokerConfig) -> ServiceResult<AppBroker> {
    config.validate()?;

    let provider = InMemoryStateStoreProvider::new()
        .with_reset_policy(ResetPolicy::from(config.reset_failed_instances));
    let store = provider.create_store();
    let deployer = provider.create_deployer(config.simulated_polls_until_ready);

    info!(
        state_store_url = %config.state_store_url,
        reset_failed_instances = config.reset_failed_instances,
        "Using in-memory state store and simulated deployer"
    );

    create_broker_with(config, store, deployer)
}

/// Create a broker over the given store and deployer
pub fn create_broker_with(
    config: &BrokerConfig,
    store: Arc<dyn InstanceStateStore>,
    deployer: Arc<dyn BackingAppDeployer>,
) -> ServiceResult<AppBroker> {
    let catalog = ServiceCatalog::from_config(&config.services);
    info!(plans = catalog.len(), "Loaded service catalog");

    let service = ProvisioningService::new(
        store,
        deployer,
        Arc::new(ConfiguredManifestResolver::new(catalog)),
        Arc::new(LoggingEventHandler),
    );

    let metrics = if config.enable_metrics {
        ProvisioningMetrics::facade()
    } else {
        ProvisioningMetrics::disabled()
    };

    Ok(AppBroker::new(service, metrics))
}
