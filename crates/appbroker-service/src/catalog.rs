//! Plan catalog and the manifest resolver built on it

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use appbroker_core::{BackingAppManifest, CreationRequest, ManifestResolver, ProvisioningError};

use crate::config::{BackingAppConfig, ServiceOffering};

/// Environment variable carrying the owning instance id
pub const INSTANCE_ID_ENV: &str = "APPBROKER_INSTANCE_ID";

/// Backing apps per (service id, plan id)
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    plans: HashMap<(String, String), Vec<BackingAppConfig>>,
}

impl ServiceCatalog {
    /// Build the catalog from configured services
    pub fn from_config(services: &[ServiceOffering]) -> Self {
        let plans = services
            .iter()
            .flat_map(|service| {
                service
                    .plans
                    .iter()
                    .map(move |plan| ((service.id.clone(), plan.id.clone()), plan.apps.clone()))
            })
            .collect();

        Self { plans }
    }

    /// Backing apps of a plan
    pub fn apps(&self, service_id: &str, plan_id: &str) -> Option<&[BackingAppConfig]> {
        self.plans
            .get(&(service_id.to_string(), plan_id.to_string()))
            .map(Vec::as_slice)
    }

    /// Number of plans
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the catalog has no plans
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// Resolver producing manifests from the configured catalog.
///
/// Each app's configured environment is merged with the request parameters
/// (parameters win) and the instance id.
#[derive(Debug, Clone)]
pub struct ConfiguredManifestResolver {
    catalog: ServiceCatalog,
}

impl ConfiguredManifestResolver {
    /// Create a resolver over a catalog
    pub fn new(catalog: ServiceCatalog) -> Self {
        Self { catalog }
    }

    fn manifest_for(request: &CreationRequest, app: &BackingAppConfig) -> BackingAppManifest {
        let instance_id = &request.instance_id().0;
        let mut manifest = BackingAppManifest::new(instance_id, app.name.as_str(), app.path.as_str());

        manifest.properties = app.properties.clone();
        manifest.environment.extend(
            app.environment
                .iter()
                .map(|variable| (variable.name.clone(), variable.value.clone())),
        );
        manifest.environment.extend(request.parameters().clone());
        manifest
            .environment
            .insert(INSTANCE_ID_ENV.to_string(), instance_id.clone().into());

        manifest
    }
}

#[async_trait]
impl ManifestResolver for ConfiguredManifestResolver {
    async fn resolve(
        &self,
        request: &CreationRequest,
    ) -> Result<Vec<BackingAppManifest>, ProvisioningError> {
        let service_id = &request.service_id().0;
        let plan_id = &request.plan_id().0;

        let apps = self.catalog.apps(service_id, plan_id).ok_or_else(|| {
            ProvisioningError::ManifestResolution(format!(
                "unknown plan {} for service {}",
                plan_id, service_id
            ))
        })?;

        let manifests: Vec<BackingAppManifest> = apps
            .iter()
            .map(|app| Self::manifest_for(request, app))
            .collect();

        debug!(
            instance_id = %request.instance_id(),
            plan_id = %plan_id,
            apps = manifests.len(),
            "Resolved backing app manifests"
        );
        Ok(manifests)
    }
}
