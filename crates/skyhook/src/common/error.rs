use thiserror::Error;

use crate::common::error::SkyhookError::GenericError;

#[derive(Debug, Error)]
pub enum SkyhookError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Contract violation: {0}")]
    ContractViolation(String),
    #[error("Worker pool capacity exceeded: {active} active + {queued} queued >= {max_workers} max workers")]
    CapacityExceeded {
        active: usize,
        queued: usize,
        max_workers: usize,
    },
    #[error("Unknown scheduler state token: {0}")]
    UnknownStateToken(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for SkyhookError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for SkyhookError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<String> for SkyhookError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
