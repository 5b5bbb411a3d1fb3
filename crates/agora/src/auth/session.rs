//! Login sessions and the resolver that maps a session token to a user.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use agora_protocol::UserId;

use super::AuthError;
use crate::users::UserRepository;
use crate::ws::Identity;

/// Format SQLite's `datetime('now')` produces, so stored expiries compare as text.
const SQLITE_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

const TOKEN_LENGTH: usize = 32;

/// Maps a session token to the user it belongs to.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Session row. The raw token is never stored.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRecord {
    pub id: i64,
    pub user_id: UserId,
    pub expires_at: String,
    pub created_at: String,
}

impl SessionRecord {
    pub fn is_expired(&self) -> bool {
        match NaiveDateTime::parse_from_str(&self.expires_at, SQLITE_DATETIME) {
            Ok(expires_at) => expires_at <= Utc::now().naive_utc(),
            Err(e) => {
                warn!("Session {} has unreadable expiry '{}': {}", self.id, self.expires_at, e);
                true
            }
        }
    }
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Repository for session database operations.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a session for `user_id` and return its token.
    #[instrument(skip(self))]
    pub async fn issue(&self, user_id: UserId, ttl: TimeDelta) -> Result<String> {
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| anyhow!("session lifetime {ttl} is out of range"))?
            .format(SQLITE_DATETIME)
            .to_string();
        let token = nanoid::nanoid!(TOKEN_LENGTH);

        sqlx::query(
            r#"
            INSERT INTO sessions (user_id, token_hash, expires_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(hash_token(&token))
        .bind(&expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert session")?;

        debug!("Issued session for user {} until {}", user_id, expires_at);
        Ok(token)
    }

    /// Find the session for a raw token, expired or not.
    #[instrument(skip(self, token))]
    pub async fn lookup(&self, token: &str) -> Result<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, user_id, expires_at, created_at
            FROM sessions
            WHERE token_hash = ?
            "#,
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session")?;

        Ok(record)
    }

    /// Delete every session of `user_id`. Returns the number removed.
    #[instrument(skip(self))]
    pub async fn revoke_user(&self, user_id: UserId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to revoke sessions")?;

        Ok(result.rows_affected())
    }

    /// Delete expired sessions. Returns the number removed.
    #[instrument(skip(self))]
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= datetime('now')")
            .execute(&self.pool)
            .await
            .context("Failed to delete expired sessions")?;

        Ok(result.rows_affected())
    }

    /// Periodically delete expired sessions until `shutdown` is cancelled.
    pub fn start_cleanup_task(
        self,
        interval_secs: u64,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        info!("Starting expired session cleanup task (every {}s)", interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match self.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!("Removed {} expired sessions", removed),
                    Err(e) => warn!("Expired session cleanup failed: {:?}", e),
                }
            }
        })
    }
}

/// Resolves tokens against the `sessions` and `users` tables.
#[derive(Debug, Clone)]
pub struct SqliteSessionResolver {
    sessions: SessionRepository,
    users: UserRepository,
}

impl SqliteSessionResolver {
    pub fn new(sessions: SessionRepository, users: UserRepository) -> Self {
        Self { sessions, users }
    }
}

#[async_trait]
impl SessionResolver for SqliteSessionResolver {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError> {
        let session = self
            .sessions
            .lookup(token)
            .await
            .map_err(|e| AuthError::Internal(format!("{e:#}")))?
            .ok_or(AuthError::InvalidToken)?;

        if session.is_expired() {
            return Err(AuthError::TokenExpired);
        }

        let user = self
            .users
            .get(session.user_id)
            .await
            .map_err(|e| AuthError::Internal(format!("{e:#}")))?
            .ok_or(AuthError::UserNotFound)?;

        Ok(Identity::new(user.id, user.username))
    }
}
