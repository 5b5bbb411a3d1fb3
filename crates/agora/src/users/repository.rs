//! User repository for database operations.

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use agora_protocol::UserId;

use super::User;

const USER_COLUMNS: &str = "id, username, email, password_hash, created_at, updated_at";

/// Repository for user database operations.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
    hash_cost: u32,
}

/// Lowest cost bcrypt accepts. Only suitable for tests.
pub const MIN_HASH_COST: u32 = 4;

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Override the bcrypt cost. Tests use [`MIN_HASH_COST`].
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Create a user with a bcrypt-hashed password.
    #[instrument(skip(self, password))]
    pub async fn create(&self, username: &str, email: &str, password: &str) -> Result<User> {
        let username = username.trim();
        let email = email.trim();
        if username.is_empty() {
            bail!("Username must not be empty");
        }
        if email.is_empty() {
            bail!("Email must not be empty");
        }
        if password.is_empty() {
            bail!("Password must not be empty");
        }
        if self.get_by_username(username).await?.is_some() {
            bail!("User '{}' already exists", username);
        }

        let password_hash = bcrypt::hash(password, self.hash_cost).context("hashing password")?;

        debug!("Creating user: {}", username);
        let result = sqlx::query(
            r#"
            INSERT INTO users (username, email, password_hash)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(username)
        .bind(email)
        .bind(&password_hash)
        .execute(&self.pool)
        .await
        .context("Failed to insert user")?;

        let id = result.last_insert_rowid();
        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User not found after creation"))
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by username")?;

        Ok(user)
    }

    /// Every user, ordered by username.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY username"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list users")?;

        Ok(users)
    }

    /// Every user other than `id`, ordered by username.
    #[instrument(skip(self))]
    pub async fn list_except(&self, id: UserId) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id != ? ORDER BY username"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list users")?;

        Ok(users)
    }

    /// Check a password against the stored hash.
    pub fn verify_password(&self, user: &User, password: &str) -> bool {
        bcrypt::verify(password, &user.password_hash).unwrap_or(false)
    }
}
