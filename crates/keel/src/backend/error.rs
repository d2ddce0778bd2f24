//! Isolation backend error types.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur while driving an isolation tool.
#[derive(Debug, Error)]
pub enum BackendError {
    /// An external tool exited unsuccessfully.
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The tool needed by this backend is not installed.
    #[error("{0} is not available on this host")]
    NotAvailable(String),

    /// The workload has no live process to act on.
    #[error("workload is not running")]
    NotRunning,

    /// Failed to parse tool output.
    #[error("failed to parse {0}")]
    Parse(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub(crate) fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }
}
