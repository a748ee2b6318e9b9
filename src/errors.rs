use thiserror::Error;

use crate::models::JobState;

/// Errors returned synchronously by the coordinator and the registry.
///
/// Outcomes of a job that has already been launched are never reported
/// through this type; they arrive as events carrying a
/// [`FailureReason`](crate::models::FailureReason).
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Output busy: {0}")]
    OutputBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {0} is still active")]
    StillActive(uuid::Uuid),

    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for TranscodeError {
    fn from(err: std::io::Error) -> Self {
        TranscodeError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TranscodeError {
    fn from(err: serde_json::Error) -> Self {
        TranscodeError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TranscodeError>;
