//! Message persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use agora_protocol::UserId;

use super::StoredMessage;

/// Persistence for private messages between two users.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Save a message and return its id.
    async fn store(&self, sender: UserId, receiver: UserId, content: &str) -> Result<i64>;

    async fn get(&self, id: i64) -> Result<Option<StoredMessage>>;

    /// Conversation between `user_a` and `user_b` in either direction, newest first.
    async fn fetch_history(
        &self,
        user_a: UserId,
        user_b: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredMessage>>;

    /// Messages addressed to `user` that have not been read.
    async fn unread_count(&self, user: UserId) -> Result<i64>;

    /// Mark everything `other` sent to `reader` as read. Returns rows changed.
    async fn mark_read(&self, reader: UserId, other: UserId) -> Result<u64>;
}

/// [`MessageStore`] over the `messages` table.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self, content))]
    async fn store(&self, sender: UserId, receiver: UserId, content: &str) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (sender_id, receiver_id, content)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(sender)
        .bind(receiver)
        .bind(content)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        let id = result.last_insert_rowid();
        debug!("Stored message {} from {} to {}", id, sender, receiver);
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: i64) -> Result<Option<StoredMessage>> {
        let message = sqlx::query_as::<_, StoredMessage>(
            r#"
            SELECT m.id, m.sender_id, m.receiver_id, m.content, m.created_at, m.is_read,
                   u.username AS sender_name
            FROM messages m
            JOIN users u ON u.id = m.sender_id
            WHERE m.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch message")?;

        Ok(message)
    }

    #[instrument(skip(self))]
    async fn fetch_history(
        &self,
        user_a: UserId,
        user_b: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredMessage>> {
        let messages = sqlx::query_as::<_, StoredMessage>(
            r#"
            SELECT m.id, m.sender_id, m.receiver_id, m.content, m.created_at, m.is_read,
                   u.username AS sender_name
            FROM messages m
            JOIN users u ON u.id = m.sender_id
            WHERE (m.sender_id = ? AND m.receiver_id = ?)
               OR (m.sender_id = ? AND m.receiver_id = ?)
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .bind(user_b)
        .bind(user_a)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch message history")?;

        Ok(messages)
    }

    #[instrument(skip(self))]
    async fn unread_count(&self, user: UserId) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE receiver_id = ? AND is_read = 0")
                .bind(user)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count unread messages")?;

        Ok(count)
    }

    #[instrument(skip(self))]
    async fn mark_read(&self, reader: UserId, other: UserId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET is_read = 1
            WHERE receiver_id = ? AND sender_id = ? AND is_read = 0
            "#,
        )
        .bind(reader)
        .bind(other)
        .execute(&self.pool)
        .await
        .context("Failed to mark messages read")?;

        Ok(result.rows_affected())
    }
}
