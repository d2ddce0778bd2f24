//! Workload controller errors.

use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("workload {0} not found")]
    NotFound(Uuid),

    /// The request is valid but collides with the current state.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid workload metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}
