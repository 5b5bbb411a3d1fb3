//! Error type shared by the HTTP handlers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::auth::AuthError;
use crate::ws::HubError;

/// Errors returned by HTTP handlers, rendered as `{error, code}` JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not authenticated: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    /// HTTP status and stable machine-readable code.
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    pub fn error_code(&self) -> &'static str {
        self.classify().1
    }
}

/// Repository errors carry their category in the message (`bail!("... not found")`).
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(hub) = err.downcast_ref::<HubError>() {
            return Self::ServiceUnavailable(hub.to_string());
        }

        let text = format!("{err:#}");
        let lower = text.to_lowercase();
        if lower.contains("not found") {
            Self::NotFound(text)
        } else if lower.contains("already exists") {
            Self::Conflict(text)
        } else if ["must not", "must be", "invalid"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            Self::BadRequest(text)
        } else {
            Self::Internal(text)
        }
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Internal(reason) => Self::Internal(format!("session lookup: {reason}")),
            rejected => Self::Unauthorized(rejected.to_string()),
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
        let (status, code) = self.classify();
        let error = self.to_string();

        if status.is_server_error() {
            if matches!(self, Self::ServiceUnavailable(_)) {
                warn!(code, %error, "request failed");
            } else {
                error!(code, %error, "request failed");
            }
        } else {
            debug!(code, %error, "request rejected");
        }

        (status, Json(ErrorResponse { error, code })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
