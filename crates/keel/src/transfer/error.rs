use keel_files::FileError;
use thiserror::Error;
use uuid::Uuid;

use crate::workload::ControllerError;

pub type TransferResult<T> = Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("workload {0} already has a transfer in progress")]
    InProgress(Uuid),

    #[error("transfer {0} not found")]
    NotFound(Uuid),

    #[error("invalid transfer request: {0}")]
    Invalid(String),

    /// The target node answered with an error status.
    #[error("target node rejected {step}: {status} {body}")]
    Rejected {
        step: &'static str,
        status: u16,
        body: String,
    },

    #[error("target node unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Files(#[from] FileError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(error: tokio::task::JoinError) -> Self {
        TransferError::Io(std::io::Error::other(error.to_string()))
    }
}
