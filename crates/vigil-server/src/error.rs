//! Error types for the Vigil server.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use vigil_alerts::AlertError;
use vigil_notify::NotifyError;

/// Errors raised while starting or running the server process.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A component could not be initialised.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The HTTP server stopped with an error.
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

impl From<NotifyError> for ServerError {
    fn from(err: NotifyError) -> Self {
        Self::Startup(err.to_string())
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Result type for HTTP handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request is malformed or fails validation.
    #[error("{0}")]
    Validation(String),

    /// The request conflicts with stored state.
    #[error("{0}")]
    Conflict(String),

    /// No user identity on the request.
    #[error("authentication required")]
    Unauthenticated,

    /// The user may not perform the action.
    #[error("permission denied")]
    Forbidden,

    /// Resource not found.
    #[error("{0}")]
    NotFound(String),

    /// Anything the caller cannot fix.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::Unauthenticated => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            message: self.to_string(),
            error: self.kind().to_string(),
        };
        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"message":"failed to serialize error","error":"internal_error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}

impl From<AlertError> for ApiError {
    fn from(err: AlertError) -> Self {
        match err {
            AlertError::InvalidRule { .. }
            | AlertError::InvalidMatcher { .. }
            | AlertError::InvalidDuration { .. }
            | AlertError::Template { .. } => Self::Validation(err.to_string()),
            AlertError::Conflict { .. } => Self::Conflict(err.to_string()),
            AlertError::RuleNotFound { .. } | AlertError::GroupNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            AlertError::Execution { .. }
            | AlertError::Store { .. }
            | AlertError::Membership { .. }
            | AlertError::SerializationError(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<NotifyError> for ApiError {
    fn from(err: NotifyError) -> Self {
        if err.is_validation() {
            return Self::Validation(err.to_string());
        }
        match err {
            NotifyError::NotFound { .. } | NotifyError::SilenceNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            NotifyError::Conflict { .. } => Self::Conflict(err.to_string()),
            NotifyError::Alerts(inner) => inner.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid JSON: {err}"))
    }
}
