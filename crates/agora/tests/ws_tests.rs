//! End-to-end WebSocket tests against a real listener.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{StatusCode, header};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

mod common;
use agora::ws::HubConfig;
use common::{TestApp, TestUser, test_app, test_app_with_config};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn serve(app: &TestApp) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn open(addr: SocketAddr, user: &TestUser) -> Result<Socket, WsError> {
    let mut request = format!("ws://{addr}/ws").into_client_request()?;
    request
        .headers_mut()
        .insert(header::COOKIE, user.cookie().parse().unwrap());
    let (socket, _) = connect_async(request).await?;
    Ok(socket)
}

/// Connect and wait until the hub lists the user as online.
async fn join(app: &TestApp, addr: SocketAddr, user: &TestUser) -> Socket {
    let socket = open(addr, user).await.unwrap();
    wait_online(app, user.id(), true).await;
    socket
}

async fn wait_online(app: &TestApp, user_id: i64, online: bool) {
    let mut presence = app.hub.subscribe_presence();
    timeout(WAIT, presence.wait_for(|ids| ids.contains(&user_id) == online))
        .await
        .expect("presence did not settle")
        .unwrap();
}

/// Next JSON text frame, skipping control frames.
async fn recv(socket: &mut Socket) -> Value {
    loop {
        let message = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::text(frame.to_string())).await.unwrap();
}

/// True once the server closes the socket.
async fn closed(socket: &mut Socket) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, socket.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

#[tokio::test]
async fn test_upgrade_without_session_is_rejected() {
    let app = test_app().await;
    let addr = serve(&app).await;

    let err = connect_async(format!("ws://{addr}/ws")).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
        other => panic!("expected HTTP 401, got {other:?}"),
    }
    assert!(app.hub.online_users().is_empty());
}

#[tokio::test]
async fn test_private_message_broadcast_and_presence() {
    let app = test_app().await;
    let addr = serve(&app).await;

    let mut alice = join(&app, addr, &app.alice).await;
    let mut bob = join(&app, addr, &app.bob).await;

    let online = recv(&mut alice).await;
    assert_eq!(online["type"], "user_online");
    assert_eq!(online["from"], app.bob.id());
    assert_eq!(online["username"], "bob");

    send(
        &mut alice,
        json!({ "type": "private_message", "to": app.bob.id(), "content": "hi bob" }),
    )
    .await;

    let delivered = recv(&mut bob).await;
    assert_eq!(delivered["type"], "private_message");
    assert_eq!(delivered["from"], app.alice.id());
    assert_eq!(delivered["to"], app.bob.id());
    assert_eq!(delivered["content"], "hi bob");
    assert_eq!(delivered["username"], "alice");
    assert!(delivered["timestamp"].as_str().unwrap().ends_with('Z'));

    let echo = recv(&mut alice).await;
    assert_eq!(echo["type"], "message_sent");
    assert_eq!(echo["content"], "hi bob");
    assert_eq!(echo["timestamp"], delivered["timestamp"]);

    send(&mut bob, json!({ "type": "broadcast", "content": "hello all" })).await;
    let broadcast = recv(&mut alice).await;
    assert_eq!(broadcast["type"], "broadcast");
    assert_eq!(broadcast["from"], app.bob.id());
    assert!(broadcast.get("to").is_none());

    bob.close(None).await.unwrap();
    wait_online(&app, app.bob.id(), false).await;
    let offline = recv(&mut alice).await;
    assert_eq!(offline["type"], "user_offline");
    assert_eq!(offline["from"], app.bob.id());
}

#[tokio::test]
async fn test_spoofed_sender_fields_are_ignored() {
    let app = test_app().await;
    let addr = serve(&app).await;

    let mut alice = join(&app, addr, &app.alice).await;
    let mut bob = join(&app, addr, &app.bob).await;
    recv(&mut alice).await;

    send(
        &mut alice,
        json!({
            "type": "private_message",
            "to": app.bob.id(),
            "content": "it's me",
            "from": 999,
            "username": "mallory",
            "timestamp": "2000-01-01T00:00:00Z"
        }),
    )
    .await;

    let delivered = recv(&mut bob).await;
    assert_eq!(delivered["from"], app.alice.id());
    assert_eq!(delivered["username"], "alice");
    assert_ne!(delivered["timestamp"], "2000-01-01T00:00:00Z");
}

#[tokio::test]
async fn test_unknown_kinds_keep_connection() {
    let app = test_app().await;
    let addr = serve(&app).await;

    let mut alice = join(&app, addr, &app.alice).await;
    let mut bob = join(&app, addr, &app.bob).await;
    recv(&mut alice).await;

    send(&mut alice, json!({ "type": "typing", "to": app.bob.id() })).await;
    send(&mut alice, json!({ "type": "user_online" })).await;
    send(&mut alice, json!({ "type": "broadcast", "content": "still here" })).await;

    let next = recv(&mut bob).await;
    assert_eq!(next["type"], "broadcast");
    assert_eq!(next["content"], "still here");
    assert!(app.hub.is_online(app.alice.id()));
}

#[tokio::test]
async fn test_undecodable_frame_disconnects() {
    let app = test_app().await;
    let addr = serve(&app).await;

    let mut alice = join(&app, addr, &app.alice).await;
    let mut bob = join(&app, addr, &app.bob).await;
    recv(&mut alice).await;

    bob.send(Message::text("not json at all")).await.unwrap();

    assert!(closed(&mut bob).await);
    wait_online(&app, app.bob.id(), false).await;
    assert_eq!(recv(&mut alice).await["type"], "user_offline");
}

#[tokio::test]
async fn test_duplicate_login_replaces_old_socket() {
    let app = test_app().await;
    let addr = serve(&app).await;

    let mut bob = join(&app, addr, &app.bob).await;
    let mut first = join(&app, addr, &app.alice).await;
    assert_eq!(recv(&mut bob).await["type"], "user_online");

    let mut second = open(addr, &app.alice).await.unwrap();
    assert!(closed(&mut first).await, "old connection should be closed");

    send(
        &mut bob,
        json!({ "type": "private_message", "to": app.alice.id(), "content": "which one?" }),
    )
    .await;
    let delivered = recv(&mut second).await;
    assert_eq!(delivered["content"], "which one?");
    assert_eq!(app.hub.online_users(), vec![app.alice.id(), app.bob.id()]);
}

#[tokio::test]
async fn test_oversized_frame_disconnects() {
    let app = test_app().await;
    let addr = serve(&app).await;

    let mut alice = join(&app, addr, &app.alice).await;
    let mut bob = join(&app, addr, &app.bob).await;
    recv(&mut alice).await;

    let content = "x".repeat(4096);
    let _ = bob
        .send(Message::text(
            json!({ "type": "broadcast", "content": content }).to_string(),
        ))
        .await;

    assert!(closed(&mut bob).await);
    wait_online(&app, app.bob.id(), false).await;
    let offline = recv(&mut alice).await;
    assert_eq!(offline["type"], "user_offline");
    assert_eq!(offline["from"], app.bob.id());
}

fn short_liveness() -> HubConfig {
    HubConfig {
        pong_wait_secs: 2,
        ping_interval_secs: 1,
        ..HubConfig::default()
    }
}

#[tokio::test]
async fn test_silent_client_is_reaped() {
    let app = test_app_with_config(short_liveness()).await;
    let addr = serve(&app).await;

    let mut alice = join(&app, addr, &app.alice).await;
    // Never polled, so bob's client answers no pings.
    let mut bob = join(&app, addr, &app.bob).await;
    assert_eq!(recv(&mut alice).await["type"], "user_online");

    let offline = recv(&mut alice).await;
    assert_eq!(offline["type"], "user_offline");
    assert_eq!(offline["from"], app.bob.id());
    wait_online(&app, app.bob.id(), false).await;
    assert!(app.hub.is_online(app.alice.id()));
    assert!(closed(&mut bob).await);
}

#[tokio::test]
async fn test_responsive_client_stays_online() {
    let app = test_app_with_config(short_liveness()).await;
    let addr = serve(&app).await;

    let mut alice = join(&app, addr, &app.alice).await;

    // Reading drives the automatic pong replies.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(3500);
    let mut pings = 0;
    loop {
        match tokio::time::timeout_at(deadline, alice.next()).await {
            Err(_) => break,
            Ok(Some(Ok(Message::Ping(_)))) => pings += 1,
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended early: {other:?}"),
        }
    }

    assert!(pings >= 2, "expected periodic pings, got {pings}");
    assert!(app.hub.is_online(app.alice.id()));
}
