//! One live WebSocket connection: mailbox, teardown and the two pumps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tokio_util::sync::CancellationToken;

use agora_protocol::{ClientFrame, Envelope, server_timestamp};

use super::hub::HubHandle;
use super::types::{ConnectionId, ConnectionState, EvictReason, HubConfig, Identity, Inbound};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why a deposit into a mailbox failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The mailbox is at capacity.
    Full,
    /// The write pump is gone or the connection was already torn down.
    Closed,
}

/// The registry's side of a connection.
///
/// Owned exclusively by the hub once registered. It holds the only sender for
/// the connection's mailbox, so dropping the mailbox sender (on teardown) is
/// what tells the write pump to close.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    mailbox: Option<mpsc::Sender<Envelope>>,
    transport: CancellationToken,
    state: ConnectionState,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its mailbox.
    ///
    /// `transport` is cancelled on teardown; both pumps watch it.
    pub fn new(
        identity: Identity,
        capacity: usize,
        transport: CancellationToken,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: next_connection_id(),
            identity,
            mailbox: Some(tx),
            transport,
            state: ConnectionState::Active,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Non-blocking deposit into the mailbox.
    pub fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        let mailbox = self.mailbox.as_ref().ok_or(DeliveryError::Closed)?;
        mailbox.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Move to `Evicted`: close the mailbox and the transport.
    ///
    /// Idempotent. Returns `false` if the connection was already torn down.
    pub fn teardown(&mut self, reason: EvictReason) -> bool {
        if let ConnectionState::Evicted(previous) = self.state {
            debug!(
                "Connection {} for {} already evicted ({})",
                self.id, self.identity, previous
            );
            return false;
        }

        self.state = ConnectionState::Evicted(reason);
        self.mailbox = None;
        self.transport.cancel();
        debug!(
            "Tore down connection {} for {} ({})",
            self.id, self.identity, reason
        );
        true
    }
}

/// The pump side of a connection, before its socket is attached.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    mailbox: mpsc::Receiver<Envelope>,
    transport: CancellationToken,
}

impl Connection {
    /// Build both halves of a new connection for `identity`.
    ///
    /// The transport token is a child of `parent`, so cancelling the parent
    /// (process shutdown) closes this connection too.
    pub fn open(
        identity: Identity,
        config: &HubConfig,
        parent: &CancellationToken,
    ) -> (Self, ConnectionHandle) {
        let transport = parent.child_token();
        let (handle, mailbox) =
            ConnectionHandle::new(identity.clone(), config.mailbox_capacity, transport.clone());
        let connection = Self {
            id: handle.id(),
            identity,
            mailbox,
            transport,
        };
        (connection, handle)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Attach the socket and run both pumps until the connection ends.
    ///
    /// The write pump is spawned; the read pump runs on the caller's task.
    pub async fn run(self, socket: WebSocket, hub: HubHandle, config: HubConfig) {
        let (sink, stream) = socket.split();

        let writer = tokio::spawn(write_pump(
            sink,
            self.mailbox,
            self.transport.clone(),
            self.identity.clone(),
            config.ping_interval(),
            config.write_wait(),
        ));

        read_pump(
            stream,
            self.identity.clone(),
            self.id,
            hub,
            self.transport.clone(),
            config.pong_wait(),
        )
        .await;

        if let Err(e) = writer.await {
            warn!("Write pump for {} panicked: {}", self.identity, e);
        }
        info!(
            "WebSocket connection {} closed for {}",
            self.id, self.identity
        );
    }
}

/// Read frames until the peer goes away, then ask the hub to unregister.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    identity: Identity,
    connection_id: ConnectionId,
    hub: HubHandle,
    transport: CancellationToken,
    pong_wait: Duration,
) {
    loop {
        let next = tokio::select! {
            _ = transport.cancelled() => {
                debug!("Read pump for {} stopping: transport closed", identity);
                break;
            }
            next = timeout(pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(
                    "No frames from {} within {:?}, treating connection as dead",
                    identity, pong_wait
                );
                break;
            }
            Ok(None) => {
                debug!("WebSocket stream ended for {}", identity);
                break;
            }
            Ok(Some(Err(e))) => {
                debug!("WebSocket read error for {}: {}", identity, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                let frame = match ClientFrame::parse(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Closing connection for {}: {}", identity, e);
                        break;
                    }
                };
                let inbound = Inbound {
                    sender: identity.clone(),
                    connection_id,
                    frame,
                    received_at: server_timestamp(),
                };
                if hub.route(inbound).await.is_err() {
                    debug!("Hub stopped, closing connection for {}", identity);
                    break;
                }
            }
            Message::Binary(_) => {
                warn!("Closing connection for {}: binary frames are not supported", identity);
                break;
            }
            // Any frame proves liveness; the timeout above restarts on the next read.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                info!("{} closed WebSocket connection ({:?})", identity, frame);
                break;
            }
        }
    }

    hub.unregister(identity.user_id, connection_id);
    transport.cancel();
}

/// Sole writer of the socket: mailbox envelopes and liveness pings.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox: mpsc::Receiver<Envelope>,
    transport: CancellationToken,
    identity: Identity,
    ping_interval: Duration,
    write_wait: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            biased;

            _ = transport.cancelled() => {
                write_frame(&mut sink, Message::Close(None), write_wait).await;
                break;
            }

            next = mailbox.recv() => {
                let Some(envelope) = next else {
                    debug!("Mailbox closed for {}, sending close frame", identity);
                    write_frame(&mut sink, Message::Close(None), write_wait).await;
                    break;
                };
                let json = match envelope.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize envelope for {}: {}", identity, e);
                        continue;
                    }
                };
                if !write_frame(&mut sink, Message::Text(json.into()), write_wait).await {
                    debug!("Write to {} failed or timed out", identity);
                    break;
                }
            }

            _ = ping.tick() => {
                if !write_frame(&mut sink, Message::Ping(Default::default()), write_wait).await {
                    debug!("Ping to {} failed or timed out", identity);
                    break;
                }
            }
        }
    }

    transport.cancel();
}

/// Write one frame under the write deadline. Returns `false` on error or timeout.
async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    write_wait: Duration,
) -> bool {
    matches!(timeout(write_wait, sink.send(message)).await, Ok(Ok(())))
}
