//! Error types for the App Broker service
//!
//! Provisioning outcomes are reported as `StatusReport`s; these errors cover
//! startup and wiring.

use appbroker_core::ProvisioningError;
use thiserror::Error;

/// Service error types
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration could not be read or is invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The configured state store URL uses an unsupported scheme
    #[error("Unsupported state store: {0}")]
    UnsupportedStore(String),

    /// Error raised by the provisioning workflow
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
}

impl From<config::ConfigError> for ServiceError {
    fn from(err: config::ConfigError) -> Self {
        ServiceError::ConfigError(err.to_string())
    }
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
