use anywhere_providers::wait::WaitError;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors returned synchronously by the provisioning service.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("region {0} is not configured")]
    InvalidRegion(String),
    #[error("instance {0} not found")]
    NotFound(Uuid),
    #[error("concurrent create detected in region {0}; request rolled back")]
    ConcurrencyViolation(String),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl OrchestratorError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidRegion(_) => "invalid_region",
            OrchestratorError::NotFound(_) => "instance_not_found",
            OrchestratorError::ConcurrencyViolation(_) => "concurrency_violation",
            OrchestratorError::Persistence(_) => "db_error",
        }
    }
}

/// Failures inside a detached workflow. Never returned to a caller; they end
/// up as `status = error` on the record and in the logs.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("provider call failed: {0:#}")]
    Provider(anyhow::Error),
    #[error("instance has no public address")]
    NoAddress,
    #[error(transparent)]
    Wait(WaitError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error("workflow cancelled")]
    Cancelled,
}

impl From<WaitError> for WorkflowError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Cancelled => WorkflowError::Cancelled,
            other => WorkflowError::Wait(other),
        }
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(e: anyhow::Error) -> Self {
        WorkflowError::Provider(e)
    }
}
