//! In-memory state store implementation for the App Broker
//!
//! This crate provides in-memory implementations of the collaborator
//! interfaces defined in the appbroker-core crate. It is primarily useful for
//! development, testing, and single-process deployments where persistence
//! across restarts is not required.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod repositories;
pub use repositories::{InMemoryInstanceStateStore, ResetPolicy};

pub mod deployer;
pub use deployer::SimulatedDeployer;

use appbroker_core::{BackingAppDeployer, InstanceStateStore};

/// Provider for in-memory collaborators
pub struct InMemoryStateStoreProvider {
    // Shared storage for instance records
    records: Arc<RwLock<HashMap<String, serde_json::Value>>>,

    reset_policy: ResetPolicy,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            reset_policy: ResetPolicy::Never,
        }
    }

    /// Set the reset policy for failed instances
    pub fn with_reset_policy(mut self, reset_policy: ResetPolicy) -> Self {
        self.reset_policy = reset_policy;
        self
    }

    /// Create a store over the shared records. Stores created by the same
    /// provider see each other's writes.
    pub fn create_store(&self) -> Arc<dyn InstanceStateStore> {
        Arc::new(InMemoryInstanceStateStore::new(
            self.records.clone(),
            self.reset_policy,
        ))
    }

    /// Create a simulated deployer
    pub fn create_deployer(&self, polls_until_ready: u32) -> Arc<dyn BackingAppDeployer> {
        Arc::new(SimulatedDeployer::new(polls_until_ready))
    }
}

impl Default for InMemoryStateStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}
