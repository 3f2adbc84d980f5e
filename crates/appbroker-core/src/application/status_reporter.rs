//! Translation of workflow results into broker protocol responses

use serde::Serialize;
use tracing::error;

use crate::application::provisioning_service::ProvisioningOutcome;
use crate::domain::instance::OperationId;
use crate::error::ProvisioningError;

/// Response handed to the marketplace-facing transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReport {
    /// Backing apps are deployed
    Created {
        /// Operation token of the provisioning
        operation: OperationId,
    },
    /// Provisioning continues asynchronously
    Accepted {
        /// Operation token to poll with
        operation: OperationId,
    },
    /// Instance id already bound to a different request
    Conflict {
        /// Detail for the caller
        reason: String,
    },
    /// Provisioning failed terminally
    Failed {
        /// Detail for the caller
        reason: String,
    },
    /// Polled instance does not exist
    Gone {
        /// Detail for the caller
        reason: String,
    },
    /// A dependency is temporarily unavailable; the call may be retried
    Unavailable {
        /// Detail for the caller
        reason: String,
    },
}

impl StatusReport {
    /// Build a report from the result of a workflow invocation
    pub fn from_result(result: &Result<ProvisioningOutcome, ProvisioningError>) -> Self {
        match result {
            Ok(ProvisioningOutcome::Created { operation }) => StatusReport::Created {
                operation: operation.clone(),
            },
            Ok(ProvisioningOutcome::Accepted { operation }) => StatusReport::Accepted {
                operation: operation.clone(),
            },
            Err(err) => Self::from_error(err),
        }
    }

    /// Build a report from a workflow error
    pub fn from_error(err: &ProvisioningError) -> Self {
        match err {
            ProvisioningError::Conflict(msg) => StatusReport::Conflict {
                reason: msg.clone(),
            },
            ProvisioningError::DeployerPermanent(msg)
            | ProvisioningError::ManifestResolution(msg) => StatusReport::Failed {
                reason: msg.clone(),
            },
            ProvisioningError::DeployerTransient(msg)
            | ProvisioningError::StoreUnavailable(msg) => StatusReport::Unavailable {
                reason: msg.clone(),
            },
            ProvisioningError::InstanceNotFound(msg) => StatusReport::Gone {
                reason: msg.clone(),
            },
            ProvisioningError::InternalConsistency(_) | ProvisioningError::Serialization(_) => {
                error!(error = %err, "Provisioning aborted by an internal error");
                StatusReport::Failed {
                    reason: "internal broker error".to_string(),
                }
            }
        }
    }

    /// HTTP status code the transport should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            StatusReport::Created { .. } => 201,
            StatusReport::Accepted { .. } => 202,
            StatusReport::Conflict { .. } => 409,
            StatusReport::Failed { .. } => 500,
            StatusReport::Gone { .. } => 410,
            StatusReport::Unavailable { .. } => 503,
        }
    }

    /// Last-operation state for poll responses
    pub fn operation_state(&self) -> &'static str {
        match self {
            StatusReport::Created { .. } => "succeeded",
            StatusReport::Accepted { .. } | StatusReport::Unavailable { .. } => "in progress",
            StatusReport::Conflict { .. }
            | StatusReport::Failed { .. }
            | StatusReport::Gone { .. } => "failed",
        }
    }

    /// Whether polling again can change the answer
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            StatusReport::Accepted { .. } | StatusReport::Unavailable { .. }
        )
    }
}
