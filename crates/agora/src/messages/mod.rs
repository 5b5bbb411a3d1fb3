//! Stored private messages.
//!
//! Used by the HTTP handlers only. Live delivery through the hub does not touch
//! the database.

mod store;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub use store::{MessageStore, SqliteMessageStore};

use agora_protocol::UserId;

pub const DEFAULT_HISTORY_LIMIT: i64 = 10;
pub const MAX_HISTORY_LIMIT: i64 = 50;

/// Message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: String,
    pub is_read: bool,
    /// Username of `sender_id`.
    pub sender_name: String,
}

/// Paging for conversation history.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl HistoryQuery {
    /// Limit in `1..=MAX_HISTORY_LIMIT`, default `DEFAULT_HISTORY_LIMIT`.
    pub fn limit(&self) -> i64 {
        match self.limit {
            Some(limit) if limit > 0 => limit.min(MAX_HISTORY_LIMIT),
            _ => DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Non-negative offset, default 0.
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_paging_defaults_and_clamps() {
        let query = HistoryQuery::default();
        assert_eq!((query.limit(), query.offset()), (10, 0));

        let query = HistoryQuery {
            limit: Some(500),
            offset: Some(-3),
        };
        assert_eq!((query.limit(), query.offset()), (50, 0));

        let query = HistoryQuery {
            limit: Some(0),
            offset: Some(20),
        };
        assert_eq!((query.limit(), query.offset()), (10, 20));
    }
}
