//! Authentication module.
//!
//! Session tokens are opaque random strings handed to clients; only their
//! SHA-256 digest is stored. The middleware accepts them from a Bearer header,
//! the `session_token` cookie or a `token` query parameter.

mod error;
mod middleware;
mod session;

pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, SESSION_COOKIE, auth_middleware, session_token};
pub use session::{SessionRecord, SessionRepository, SessionResolver, SqliteSessionResolver};
