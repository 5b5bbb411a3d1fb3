//! Authentication middleware.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::{
        HeaderMap,
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
    },
    middleware::Next,
    response::Response,
};
use log::debug;

use super::{AuthError, SessionResolver};
use crate::ws::Identity;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session_token";

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == cookie_name).then_some(value.trim())
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Find the session token on a request.
///
/// Checked in order: `Authorization: Bearer`, the session cookie, then the
/// `token` query parameter (browsers cannot set headers on WebSocket upgrades).
pub fn session_token(headers: &HeaderMap, query: Option<&str>) -> Result<String, AuthError> {
    if let Some(header) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        return bearer_token_from_header(header).map(str::to_string);
    }

    let cookie_token = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .find_map(|cookies| token_from_cookie_header(cookies, SESSION_COOKIE));
    if let Some(token) = cookie_token.filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }

    query
        .and_then(token_from_query)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    resolver: Arc<dyn SessionResolver>,
}

impl AuthState {
    pub fn new(resolver: Arc<dyn SessionResolver>) -> Self {
        Self { resolver }
    }

    pub async fn authenticate(&self, parts: &Parts) -> Result<Identity, AuthError> {
        let token = session_token(&parts.headers, parts.uri.query())?;
        self.resolver.resolve(&token).await
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

impl CurrentUser {
    pub fn id(&self) -> agora_protocol::UserId {
        self.0.user_id
    }

    pub fn identity(&self) -> &Identity {
        &self.0
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Authentication middleware.
///
/// Resolves the session and injects `CurrentUser` into request extensions.
/// Requests without a valid session are rejected with 401 before reaching the
/// handler, so a WebSocket upgrade is never attempted for them.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let (mut parts, body) = req.into_parts();

    let identity = auth.authenticate(&parts).await.inspect_err(|e| {
        debug!("Rejected {} {}: {}", parts.method, parts.uri.path(), e);
    })?;

    parts.extensions.insert(CurrentUser(identity));
    Ok(next
        .run(axum::http::Request::from_parts(parts, body))
        .await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_from_header_valid() {
        assert_eq!(bearer_token_from_header("Bearer abc123").unwrap(), "abc123");
        assert_eq!(bearer_token_from_header("bearer   tok").unwrap(), "tok");
        assert_eq!(bearer_token_from_header("  Bearer\tmixed ").unwrap(), "mixed");
    }

    #[test]
    fn test_bearer_token_from_header_invalid() {
        for case in ["", "Bearer", "Bearer ", "Token x", "Bearer a b", "bear x"] {
            assert!(bearer_token_from_header(case).is_err(), "{case} should fail");
        }
    }

    #[test]
    fn test_cookie_lookup() {
        let header = "theme=dark; session_token=abc ; other=1";
        assert_eq!(token_from_cookie_header(header, SESSION_COOKIE), Some("abc"));
        assert_eq!(token_from_cookie_header("theme=dark", SESSION_COOKIE), None);
    }

    #[test]
    fn test_query_token_is_url_decoded() {
        assert_eq!(token_from_query("a=1&token=x%2By"), Some("x+y".to_string()));
        assert_eq!(token_from_query("tokens=1"), None);
    }

    #[test]
    fn test_session_token_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session_token=cookie"));
        assert_eq!(session_token(&headers, Some("token=query")).unwrap(), "cookie");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header"));
        assert_eq!(session_token(&headers, Some("token=query")).unwrap(), "header");

        assert_eq!(
            session_token(&HeaderMap::new(), Some("token=query")).unwrap(),
            "query"
        );
        assert!(matches!(
            session_token(&HeaderMap::new(), None),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn test_malformed_header_does_not_fall_through() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9v"));
        headers.insert(COOKIE, HeaderValue::from_static("session_token=cookie"));
        assert!(matches!(
            session_token(&headers, None),
            Err(AuthError::InvalidAuthHeader)
        ));
    }
}
