//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keel_files::FileError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::transfer::TransferError;
use crate::workload::ControllerError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    TooManyRequests(String),

    #[error("{0}")]
    Internal(String),

    /// An external tool or node failed.
    #[error("{0}")]
    BadGateway(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Conflict(_) => "CONFLICT",
            Self::PayloadTooLarge(_) => "TOO_LARGE",
            Self::TooManyRequests(_) => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::BadGateway(_) => "BACKEND_ERROR",
        }
    }
}

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::BadGateway(msg) => {
                warn!(error_code = code, message = %msg, "Backend error");
            }
            _ => {
                debug!(error_code = code, message = %message, "Client error");
            }
        }

        (
            status,
            Json(ErrorResponse {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        let msg = err.to_string();
        match err {
            ControllerError::NotFound(_) => ApiError::NotFound(msg),
            ControllerError::Conflict(_) => ApiError::Conflict(msg),
            ControllerError::Validation(_) => ApiError::BadRequest(msg),
            ControllerError::Backend(_) => ApiError::BadGateway(msg),
            ControllerError::Io(_) | ControllerError::Serialization(_) => ApiError::Internal(msg),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        let msg = err.to_string();
        match err {
            FileError::NotFound(_) => ApiError::NotFound(msg),
            FileError::PathTraversal
            | FileError::InvalidPath(_)
            | FileError::NotADirectory
            | FileError::NotAFile => ApiError::BadRequest(msg),
            FileError::AlreadyExists(_) => ApiError::Conflict(msg),
            FileError::FileTooLarge { .. } => ApiError::PayloadTooLarge(msg),
            FileError::Io(_) | FileError::Archive(_) => ApiError::Internal(msg),
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Controller(e) => e.into(),
            TransferError::Files(e) => e.into(),
            TransferError::InProgress(_) => ApiError::Conflict(err.to_string()),
            TransferError::NotFound(_) => ApiError::NotFound(err.to_string()),
            TransferError::Invalid(_) => ApiError::BadRequest(err.to_string()),
            TransferError::Rejected { .. } | TransferError::Http(_) => {
                ApiError::BadGateway(err.to_string())
            }
            TransferError::Io(_) => ApiError::Internal(err.to_string()),
        }
    }
}
