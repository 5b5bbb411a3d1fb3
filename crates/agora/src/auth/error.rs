//! Authentication errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No session token in the header, cookie or query string.
    #[error("missing session token")]
    MissingToken,

    /// Authorization header present but not `Bearer <token>`.
    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    /// Token does not match any session.
    #[error("invalid session token")]
    InvalidToken,

    #[error("session expired")]
    TokenExpired,

    /// Session points at a user that no longer exists.
    #[error("user not found")]
    UserNotFound,

    #[error("internal auth error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidAuthHeader => "invalid_auth_header",
            AuthError::InvalidToken => "invalid_token",
            AuthError::TokenExpired => "token_expired",
            AuthError::UserNotFound => "user_not_found",
            AuthError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(AuthErrorResponse {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });

        (status, body).into_response()
    }
}
