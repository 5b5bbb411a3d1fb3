//! Test utilities and common setup.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;

use agora::api::{self, AppState};
use agora::auth::{AuthState, SessionRepository, SqliteSessionResolver};
use agora::db::Database;
use agora::messages::SqliteMessageStore;
use agora::users::{MIN_HASH_COST, User, UserRepository};
use agora::ws::{Hub, HubConfig, HubHandle};

/// A router over an in-memory database with two users and a running hub.
pub struct TestApp {
    pub router: Router,
    pub hub: HubHandle,
    pub shutdown: CancellationToken,
    pub users: UserRepository,
    pub sessions: SessionRepository,
    pub alice: TestUser,
    pub bob: TestUser,
}

#[derive(Debug, Clone)]
pub struct TestUser {
    pub user: User,
    pub token: String,
}

impl TestUser {
    pub fn id(&self) -> i64 {
        self.user.id
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    pub fn cookie(&self) -> String {
        format!("{}={}", agora::auth::SESSION_COOKIE, self.token)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TestApp {
    /// Create another user with a live session.
    pub async fn add_user(&self, username: &str) -> TestUser {
        create_user(&self.users, &self.sessions, username).await
    }
}

async fn create_user(
    users: &UserRepository,
    sessions: &SessionRepository,
    username: &str,
) -> TestUser {
    let user = users
        .create(username, &format!("{username}@example.com"), "password123")
        .await
        .expect("create user");
    let token = sessions
        .issue(user.id, TimeDelta::hours(1))
        .await
        .expect("issue session");
    TestUser { user, token }
}

pub async fn test_app() -> TestApp {
    test_app_with_config(HubConfig::default()).await
}

pub async fn test_app_with_config(hub_config: HubConfig) -> TestApp {
    let database = Database::in_memory().await.expect("in-memory database");
    let pool = database.pool().clone();

    let users = UserRepository::new(pool.clone()).with_hash_cost(MIN_HASH_COST);
    let sessions = SessionRepository::new(pool.clone());

    let shutdown = CancellationToken::new();
    let (hub, _task) = Hub::spawn(&hub_config, shutdown.clone());

    let resolver = SqliteSessionResolver::new(sessions.clone(), users.clone());
    let state = AppState {
        hub: hub.clone(),
        hub_config: Arc::new(hub_config),
        users: users.clone(),
        messages: Arc::new(SqliteMessageStore::new(pool)),
        auth: AuthState::new(Arc::new(resolver)),
        allowed_origins: Arc::new(Vec::new()),
    };

    let alice = create_user(&users, &sessions, "alice").await;
    let bob = create_user(&users, &sessions, "bob").await;

    TestApp {
        router: api::create_router(state),
        hub,
        shutdown,
        users,
        sessions,
        alice,
        bob,
    }
}
