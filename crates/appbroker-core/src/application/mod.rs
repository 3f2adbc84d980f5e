/// Provisioning workflow engine
pub mod provisioning_service;

/// Per-instance locking
pub mod instance_locks;

/// Mapping of workflow results to broker responses
pub mod status_reporter;
