use thiserror::Error;

/// Error type for the provisioning workflow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// The instance id is already bound to a materially different request
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The deployer could not be reached or answered with a retryable failure
    #[error("Deployer transient error: {0}")]
    DeployerTransient(String),

    /// The deployer reported a failed deployment
    #[error("Deployer permanent error: {0}")]
    DeployerPermanent(String),

    /// The instance state store could not be reached
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// A workflow step attempted a non-monotonic state transition
    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    /// No record exists for the polled instance
    #[error("Service instance not found: {0}")]
    InstanceNotFound(String),

    /// Backing application manifests could not be produced for the request
    #[error("Manifest resolution error: {0}")]
    ManifestResolution(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProvisioningError {
    /// Whether repeating the same call later can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisioningError::DeployerTransient(_) | ProvisioningError::StoreUnavailable(_)
        )
    }
}

/// Errors raised by an instance state store implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend is unreachable or refused the operation
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded
    #[error("state store serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by a backing-app deployer implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployerError {
    /// Network failure or 5xx from the platform; the call may be retried
    #[error("transient deployer failure: {0}")]
    Transient(String),

    /// The platform rejected the deployment
    #[error("deployment rejected: {0}")]
    Permanent(String),
}

impl From<StoreError> for ProvisioningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ProvisioningError::StoreUnavailable(msg),
            StoreError::Serialization(msg) => ProvisioningError::Serialization(msg),
        }
    }
}

impl From<DeployerError> for ProvisioningError {
    fn from(err: DeployerError) -> Self {
        match err {
            DeployerError::Transient(msg) => ProvisioningError::DeployerTransient(msg),
            DeployerError::Permanent(msg) => ProvisioningError::DeployerPermanent(msg),
        }
    }
}

impl From<serde_json::Error> for ProvisioningError {
    fn from(err: serde_json::Error) -> Self {
        ProvisioningError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisioningError>;
