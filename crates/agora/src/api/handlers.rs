//! HTTP handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use agora_protocol::UserId;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::auth::CurrentUser;
use crate::messages::{HistoryQuery, StoredMessage};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub success: bool,
    pub users: Vec<UserId>,
}

/// GET /api/online-users
///
/// Point-in-time copy of the hub's registry; may be stale by the time it arrives.
pub async fn online_users(State(state): State<AppState>) -> Json<OnlineUsersResponse> {
    Json(OnlineUsersResponse {
        success: true,
        users: state.hub.online_users(),
    })
}

#[derive(Debug, Serialize)]
pub struct UserEntry {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub is_online: bool,
}

#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub success: bool,
    pub users: Vec<UserEntry>,
}

/// GET /api/users
#[instrument(skip(state, user), fields(user_id = user.id()))]
pub async fn list_users(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<UsersResponse>> {
    let online = state.hub.online_users();
    let users = state
        .users
        .list_except(user.id())
        .await?
        .into_iter()
        .map(|u| UserEntry {
            is_online: online.binary_search(&u.id).is_ok(),
            id: u.id,
            username: u.username,
            email: u.email,
        })
        .collect();

    Ok(Json(UsersResponse {
        success: true,
        users,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: StoredMessage,
}

/// POST /api/messages/send
///
/// Persists only. Live delivery goes through the WebSocket hub.
#[instrument(skip(state, user, request), fields(user_id = user.id()))]
pub async fn send_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Json<MessageResponse>> {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("Message content cannot be empty"));
    }
    if state.users.get(request.receiver_id).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "User {}",
            request.receiver_id
        )));
    }

    let id = state
        .messages
        .store(user.id(), request.receiver_id, &request.content)
        .await?;
    let message = state
        .messages
        .get(id)
        .await?
        .ok_or_else(|| ApiError::internal("Message not found after insert"))?;

    debug!("User {} stored message {} for {}", user.id(), id, request.receiver_id);
    Ok(Json(MessageResponse {
        success: true,
        message,
    }))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub messages: Vec<StoredMessage>,
}

/// GET /api/messages/history/{user_id}
///
/// Newest first. Marks the other user's messages to the caller as read.
#[instrument(skip(state, user), fields(user_id = user.id()))]
pub async fn message_history(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(other): Path<UserId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let messages = state
        .messages
        .fetch_history(user.id(), other, query.limit(), query.offset())
        .await?;
    state.messages.mark_read(user.id(), other).await?;

    Ok(Json(HistoryResponse {
        success: true,
        messages,
    }))
}

#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    pub success: bool,
    pub count: i64,
}

/// GET /api/messages/unread
#[instrument(skip(state, user), fields(user_id = user.id()))]
pub async fn unread_count(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<UnreadResponse>> {
    let count = state.messages.unread_count(user.id()).await?;
    Ok(Json(UnreadResponse {
        success: true,
        count,
    }))
}
