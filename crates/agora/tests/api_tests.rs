//! API integration tests.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{TestUser, test_app};

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get_as(user: &TestUser, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .header(header::AUTHORIZATION, user.bearer())
        .body(Body::empty())
        .unwrap()
}

fn post_message(user: &TestUser, body: Value) -> Request<Body> {
    Request::builder()
        .uri("/api/messages/send")
        .method(Method::POST)
        .header(header::AUTHORIZATION, user.bearer())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_protected_routes_require_session() {
    let app = test_app().await;

    for uri in [
        "/api/online-users",
        "/api/users",
        "/api/messages/unread",
        "/ws",
    ] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, _) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
    }
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let app = test_app().await;

    let request = Request::builder()
        .uri("/api/users")
        .header(header::AUTHORIZATION, "Bearer not-a-real-token")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_revoked_session_rejected() {
    let app = test_app().await;
    app.sessions.revoke_user(app.alice.id()).await.unwrap();

    let (status, _) = send(&app.router, get_as(&app.alice, "/api/users")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_cookie_accepted() {
    let app = test_app().await;

    let request = Request::builder()
        .uri("/api/messages/unread")
        .header(header::COOKIE, app.alice.cookie())
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 0);
}

#[tokio::test]
async fn test_online_users_empty_without_connections() {
    let app = test_app().await;

    let (status, json) = send(&app.router, get_as(&app.alice, "/api/online-users")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["users"], json!([]));
}

#[tokio::test]
async fn test_list_users_excludes_caller() {
    let app = test_app().await;
    let carol = app.add_user("carol").await;

    let (status, json) = send(&app.router, get_as(&app.alice, "/api/users")).await;

    assert_eq!(status, StatusCode::OK);
    let users = json["users"].as_array().unwrap();
    let names: Vec<&str> = users
        .iter()
        .map(|u| u["username"].as_str().unwrap())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"bob"));
    assert!(names.contains(&carol.user.username.as_str()));
    assert!(!names.contains(&"alice"));
    assert!(users.iter().all(|u| u["is_online"] == false));
    assert!(users.iter().all(|u| u.get("password_hash").is_none()));
}

#[tokio::test]
async fn test_send_message_validation() {
    let app = test_app().await;

    let (status, json) = send(
        &app.router,
        post_message(&app.alice, json!({ "receiver_id": app.bob.id(), "content": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");

    let (status, _) = send(
        &app.router,
        post_message(&app.alice, json!({ "receiver_id": 9999, "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_send_message_and_read_history() {
    let app = test_app().await;

    for content in ["first", "second"] {
        let (status, json) = send(
            &app.router,
            post_message(&app.alice, json!({ "receiver_id": app.bob.id(), "content": content })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["message"]["content"], content);
        assert_eq!(json["message"]["sender_name"], "alice");
        assert_eq!(json["message"]["is_read"], false);
    }

    let (_, json) = send(&app.router, get_as(&app.bob, "/api/messages/unread")).await;
    assert_eq!(json["count"], 2);

    let uri = format!("/api/messages/history/{}?limit=1", app.alice.id());
    let (status, json) = send(&app.router, get_as(&app.bob, &uri)).await;
    assert_eq!(status, StatusCode::OK);
    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "second");

    let (_, json) = send(&app.router, get_as(&app.bob, "/api/messages/unread")).await;
    assert_eq!(json["count"], 0);

    // The sender's own view does not mark anything.
    let uri = format!("/api/messages/history/{}", app.bob.id());
    let (_, json) = send(&app.router, get_as(&app.alice, &uri)).await;
    assert_eq!(json["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_history_limit_is_clamped() {
    let app = test_app().await;

    let uri = format!("/api/messages/history/{}?limit=500&offset=-3", app.bob.id());
    let (status, json) = send(&app.router, get_as(&app.alice, &uri)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["messages"], json!([]));
}
