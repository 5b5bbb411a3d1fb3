//! WebSocket upgrade gate.

use axum::{
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    response::Response,
};
use log::{debug, info, warn};

use crate::api::AppState;
use crate::auth::CurrentUser;

use super::connection::Connection;
use super::hub::HubHandle;
use super::types::{HubConfig, Identity};

/// WebSocket upgrade handler.
///
/// GET /ws
///
/// Sits behind the auth middleware, so `user` is always authenticated here.
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = user.identity().clone();
    info!("WebSocket upgrade request from {}", identity);

    let hub = state.hub.clone();
    let config = HubConfig::clone(&state.hub_config);
    let failed_for = identity.clone();

    ws.max_message_size(config.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!("WebSocket handshake failed for {}: {}", failed_for, e);
        })
        .on_upgrade(move |socket| handle_socket(socket, hub, identity, config))
}

/// Register the connection, then run its pumps.
///
/// The pumps start only after the registration is queued, and the hub always
/// drains registrations ahead of routed frames.
async fn handle_socket(socket: WebSocket, hub: HubHandle, identity: Identity, config: HubConfig) {
    let (connection, handle) = Connection::open(identity.clone(), &config, hub.shutdown_token());
    let connection_id = connection.id();

    if hub.register(handle).await.is_err() {
        warn!("Hub not running, dropping connection for {}", identity);
        return;
    }
    debug!("Connection {} for {} handed to hub", connection_id, identity);

    connection.run(socket, hub, config).await;
}
