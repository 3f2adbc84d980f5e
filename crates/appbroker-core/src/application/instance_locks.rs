//! Identity-scoped mutual exclusion
//!
//! Invocations for the same service instance must not interleave: loading a
//! record and creating it are two separate store calls. Distinct identities
//! never share a lock.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::domain::instance::InstanceId;

/// Guard held for the duration of one invocation
pub type InstanceLockGuard = OwnedMutexGuard<()>;

/// Table of per-instance locks
#[derive(Debug, Clone, Default)]
pub struct InstanceLocks {
    locks: Arc<DashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an instance
    pub async fn acquire(&self, id: &InstanceId) -> InstanceLockGuard {
        // The map entry must not be held across the await below.
        let lock = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        trace!(instance_id = %id, "Waiting for instance lock");
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits for
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of identities with a lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
