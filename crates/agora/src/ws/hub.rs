//! Registry of live connections.
//!
//! All mutation happens inside [`Hub::run`]. Everything else talks to the hub
//! through a cloneable [`HubHandle`] and reads presence from a watch snapshot.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use agora_protocol::{ClientRequest, Envelope, EnvelopeKind, UserId};

use super::connection::{ConnectionHandle, DeliveryError};
use super::types::{ConnectionId, EvictReason, HubConfig, HubError, Identity, Inbound};

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Offline,
    Evicted,
}

/// The hub loop and the state it owns.
pub struct Hub {
    connections: BTreeMap<UserId, ConnectionHandle>,
    register_rx: mpsc::Receiver<ConnectionHandle>,
    unregister_rx: mpsc::UnboundedReceiver<(UserId, ConnectionId)>,
    route_rx: mpsc::Receiver<Inbound>,
    presence: watch::Sender<Vec<UserId>>,
    /// Users removed since the last offline fan-out.
    departed: VecDeque<Identity>,
    shutdown: CancellationToken,
}

/// Cloneable entry point into a running hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<ConnectionHandle>,
    unregister_tx: mpsc::UnboundedSender<(UserId, ConnectionId)>,
    route_tx: mpsc::Sender<Inbound>,
    presence: watch::Receiver<Vec<UserId>>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Build a hub and its handle. `shutdown` stops the loop when cancelled.
    pub fn new(config: &HubConfig, shutdown: CancellationToken) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(config.register_buffer);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (route_tx, route_rx) = mpsc::channel(config.route_buffer);
        let (presence_tx, presence_rx) = watch::channel(Vec::new());

        let hub = Self {
            connections: BTreeMap::new(),
            register_rx,
            unregister_rx,
            route_rx,
            presence: presence_tx,
            departed: VecDeque::new(),
            shutdown: shutdown.clone(),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            route_tx,
            presence: presence_rx,
            shutdown,
        };
        (hub, handle)
    }

    /// Build a hub and run it on its own task.
    pub fn spawn(config: &HubConfig, shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config, shutdown);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Process events one at a time until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Connection hub started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Connection hub shutting down");
                    break;
                }
                Some(connection) = self.register_rx.recv() => self.register(connection),
                Some((user_id, connection_id)) = self.unregister_rx.recv() => {
                    self.unregister(user_id, connection_id)
                }
                Some(inbound) = self.route_rx.recv() => self.route(inbound),
                else => {
                    info!("All hub handles dropped, stopping");
                    break;
                }
            }
            self.announce_departures();
        }

        self.close_all();
    }

    fn register(&mut self, connection: ConnectionHandle) {
        let identity = connection.identity().clone();
        let connection_id = connection.id();

        if let Some(mut previous) = self.connections.insert(identity.user_id, connection) {
            previous.teardown(EvictReason::Replaced);
            info!(
                "Connection {} for {} replaced by {}",
                previous.id(),
                identity,
                connection_id
            );
        }
        self.publish();
        info!(
            "Registered connection {} for {} ({} online)",
            connection_id,
            identity,
            self.connections.len()
        );

        let online = Envelope::presence(true, identity.user_id, &identity.username);
        self.fan_out(&online, Some(identity.user_id));
    }

    fn unregister(&mut self, user_id: UserId, connection_id: ConnectionId) {
        match self.connections.get(&user_id) {
            Some(current) if current.id() == connection_id => {
                self.evict(user_id, EvictReason::TransportClosed);
            }
            Some(current) => debug!(
                "Ignoring stale unregister for user {} (connection {}, current {})",
                user_id,
                connection_id,
                current.id()
            ),
            None => debug!(
                "Ignoring unregister for user {}: connection {} already gone",
                user_id, connection_id
            ),
        }
    }

    fn route(&mut self, inbound: Inbound) {
        let Inbound {
            sender,
            connection_id,
            frame,
            received_at,
        } = inbound;

        let is_current = self
            .connections
            .get(&sender.user_id)
            .is_some_and(|current| current.id() == connection_id);
        if !is_current {
            debug!(
                "Dropping frame from {} on retired connection {}",
                sender, connection_id
            );
            return;
        }

        let request = match frame.request() {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping frame from {}: {}", sender, e);
                return;
            }
        };

        match request {
            ClientRequest::PrivateMessage { to, content } => {
                let message = Envelope {
                    kind: EnvelopeKind::PrivateMessage,
                    from: sender.user_id,
                    to: Some(to),
                    content,
                    username: sender.username,
                    timestamp: received_at,
                };
                let echo = message.echo();
                if self.deliver(to, message) == Delivery::Offline {
                    debug!("Private message from user {} to offline user {}", sender.user_id, to);
                }
                self.deliver(sender.user_id, echo);
            }
            ClientRequest::Broadcast { content } => {
                let message = Envelope {
                    kind: EnvelopeKind::Broadcast,
                    from: sender.user_id,
                    to: None,
                    content,
                    username: sender.username,
                    timestamp: received_at,
                };
                self.fan_out(&message, Some(sender.user_id));
            }
        }
    }

    /// Deliver a copy to every registered connection except `skip`.
    fn fan_out(&mut self, envelope: &Envelope, skip: Option<UserId>) {
        let targets: Vec<UserId> = self
            .connections
            .keys()
            .copied()
            .filter(|user_id| Some(*user_id) != skip)
            .collect();
        for user_id in targets {
            self.deliver(user_id, envelope.clone());
        }
    }

    fn deliver(&mut self, user_id: UserId, envelope: Envelope) -> Delivery {
        let Some(connection) = self.connections.get(&user_id) else {
            return Delivery::Offline;
        };
        match connection.deliver(envelope) {
            Ok(()) => Delivery::Delivered,
            Err(DeliveryError::Full) => {
                warn!(
                    "Mailbox full for {}, evicting slow connection {}",
                    connection.identity(),
                    connection.id()
                );
                self.evict(user_id, EvictReason::SlowConsumer);
                Delivery::Evicted
            }
            Err(DeliveryError::Closed) => {
                debug!("Mailbox closed for {}", connection.identity());
                self.evict(user_id, EvictReason::TransportClosed);
                Delivery::Evicted
            }
        }
    }

    /// Remove and tear down the current entry for `user_id`.
    ///
    /// The offline announcement is queued rather than sent here, since sending
    /// it can evict further connections.
    fn evict(&mut self, user_id: UserId, reason: EvictReason) {
        let Some(mut connection) = self.connections.remove(&user_id) else {
            return;
        };
        connection.teardown(reason);
        self.publish();
        info!(
            "Unregistered connection {} for {} ({}, {} online)",
            connection.id(),
            connection.identity(),
            reason,
            self.connections.len()
        );
        self.departed.push_back(connection.identity().clone());
    }

    fn announce_departures(&mut self) {
        while let Some(gone) = self.departed.pop_front() {
            let offline = Envelope::presence(false, gone.user_id, &gone.username);
            self.fan_out(&offline, None);
        }
    }

    fn close_all(&mut self) {
        let count = self.connections.len();
        for (_, mut connection) in std::mem::take(&mut self.connections) {
            connection.teardown(EvictReason::Shutdown);
        }
        self.departed.clear();
        self.publish();
        info!("Connection hub stopped, closed {} connections", count);
    }

    fn publish(&self) {
        self.presence
            .send_replace(self.connections.keys().copied().collect());
    }
}

impl HubHandle {
    /// Hand a freshly upgraded connection to the hub.
    ///
    /// Returns once the hub has accepted it into its queue. Because the loop
    /// prefers registrations over routed frames, the entry is in place before
    /// anything the connection forwards afterwards.
    pub async fn register(&self, connection: ConnectionHandle) -> Result<(), HubError> {
        self.register_tx
            .send(connection)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Ask the hub to drop `connection_id` for `user_id`. Never blocks.
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) {
        if self.unregister_tx.send((user_id, connection_id)).is_err() {
            debug!("Hub already stopped, unregister for user {} dropped", user_id);
        }
    }

    /// Forward an inbound frame for routing.
    pub async fn route(&self, inbound: Inbound) -> Result<(), HubError> {
        self.route_tx
            .send(inbound)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Point-in-time copy of the registered user ids, ascending.
    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.borrow().clone()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.presence.borrow().binary_search(&user_id).is_ok()
    }

    /// Watch the presence snapshot change over time.
    pub fn subscribe_presence(&self) -> watch::Receiver<Vec<UserId>> {
        self.presence.clone()
    }

    /// Token cancelled when the hub shuts down. Connection tokens are children of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
