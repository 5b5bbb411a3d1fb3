//! Forum users.

mod repository;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub use repository::{MIN_HASH_COST, UserRepository};

use agora_protocol::UserId;

/// User row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: String,
    pub updated_at: String,
}
