/// Service instance identity, requests and stored records
pub mod instance;

/// Backing application lifecycle and manifests
pub mod backing_app;

/// Per-invocation request context
pub mod context;

/// Domain events
pub mod events;

/// Collaborator interfaces
pub mod repository;
