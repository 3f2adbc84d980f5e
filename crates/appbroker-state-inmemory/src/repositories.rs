use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use appbroker_core::{
    BackingAppState, InstanceId, InstanceRecord, InstanceStateStore, StoreError,
};

/// Whether failed instances may be discarded by a fresh creation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Failed records are kept until removed by an operator
    #[default]
    Never,
    /// Failed records are reset by the next creation call for the identity
    AllowFailed,
}

impl From<bool> for ResetPolicy {
    fn from(allow: bool) -> Self {
        if allow {
            ResetPolicy::AllowFailed
        } else {
            ResetPolicy::Never
        }
    }
}

/// In-memory implementation of the InstanceStateStore.
///
/// Records are kept in their serialized form so every read hands out an
/// independent snapshot.
pub struct InMemoryInstanceStateStore {
    records: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    reset_policy: ResetPolicy,
}

impl InMemoryInstanceStateStore {
    /// Create a new in-memory instance state store
    pub fn new(
        records: Arc<RwLock<HashMap<String, serde_json::Value>>>,
        reset_policy: ResetPolicy,
    ) -> Self {
        Self {
            records,
            reset_policy,
        }
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records in the given state
    pub async fn list_by_state(&self, state: BackingAppState) -> Result<Vec<InstanceRecord>, StoreError> {
        let records = self.records.read().await;

        let mut result = Vec::new();
        for value in records.values() {
            let record: InstanceRecord = serde_json::from_value(value.clone())?;
            if record.state == state {
                result.push(record);
            }
        }
        result.sort_by(|a, b| a.instance_id().cmp(b.instance_id()));
        Ok(result)
    }
}

impl Default for InMemoryInstanceStateStore {
    fn default() -> Self {
        Self::new(Arc::new(RwLock::new(HashMap::new())), ResetPolicy::Never)
    }
}

#[async_trait]
impl InstanceStateStore for InMemoryInstanceStateStore {
    async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
        let records = self.records.read().await;
        match records.get(&id.0) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        let mut records = self.records.write().await;
        records.insert(record.instance_id().0.clone(), value);
        debug!(instance_id = %record.instance_id(), state = %record.state, "Stored instance record");
        Ok(())
    }

    async fn create_if_absent(&self, record: &InstanceRecord) -> Result<bool, StoreError> {
        let value = serde_json::to_value(record)?;
        let mut records = self.records.write().await;

        if records.contains_key(&record.instance_id().0) {
            debug!(instance_id = %record.instance_id(), "Instance record already exists");
            return Ok(false);
        }

        records.insert(record.instance_id().0.clone(), value);
        debug!(instance_id = %record.instance_id(), "Created instance record");
        Ok(true)
    }

    async fn reset(&self, id: &InstanceId) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.remove(&id.0).is_some() {
            debug!(instance_id = %id, "Reset instance record");
        }
        Ok(())
    }

    fn permits_reset(&self, record: &InstanceRecord) -> bool {
        self.reset_policy == ResetPolicy::AllowFailed && record.state == BackingAppState::Failed
    }
}
