//! Internal types shared by the hub, connections and the upgrade gate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use agora_protocol::{ClientFrame, UserId};

/// Unique per live connection. A reconnect for the same user gets a new one.
pub type ConnectionId = u64;

/// Authenticated user bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.username, self.user_id)
    }
}

/// A client frame stamped by the read pump that received it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub sender: Identity,
    pub connection_id: ConnectionId,
    pub frame: ClientFrame,
    pub received_at: DateTime<Utc>,
}

/// Lifecycle of a connection as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Evicted(EvictReason),
}

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The mailbox was full when the hub tried to deliver.
    SlowConsumer,
    /// A newer connection for the same user took its place.
    Replaced,
    /// One of the pumps hit a read/write/decode failure or the peer closed.
    TransportClosed,
    /// The process is shutting down.
    Shutdown,
}

impl std::fmt::Display for EvictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictReason::SlowConsumer => write!(f, "slow consumer"),
            EvictReason::Replaced => write!(f, "replaced"),
            EvictReason::TransportClosed => write!(f, "transport closed"),
            EvictReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Errors returned by [`super::HubHandle`].
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub loop has stopped.
    #[error("hub is not running")]
    Closed,
}

/// Hub and connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Pending outbound envelopes per connection before it counts as too slow.
    pub mailbox_capacity: usize,
    /// Inbound frames queued between read pumps and the hub.
    pub route_buffer: usize,
    /// Pending registrations queued between the upgrade gate and the hub.
    pub register_buffer: usize,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Idle read timeout; reset by every inbound frame, including pongs.
    pub pong_wait_secs: u64,
    /// Period of liveness pings. Must be shorter than `pong_wait_secs`.
    pub ping_interval_secs: u64,
    /// Deadline for a single write to the transport.
    pub write_wait_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            route_buffer: 1024,
            register_buffer: 64,
            max_message_size: 512,
            pong_wait_secs: 60,
            ping_interval_secs: 54,
            write_wait_secs: 10,
        }
    }
}

/// Invalid hub configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubConfigError {
    #[error("hub.{0} must be greater than zero")]
    Zero(&'static str),
    #[error("hub.ping_interval_secs ({ping}) must be shorter than hub.pong_wait_secs ({pong})")]
    PingNotBeforeTimeout { ping: u64, pong: u64 },
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), HubConfigError> {
        let sizes = [
            ("mailbox_capacity", self.mailbox_capacity),
            ("route_buffer", self.route_buffer),
            ("register_buffer", self.register_buffer),
            ("max_message_size", self.max_message_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(HubConfigError::Zero(name));
        }
        if self.write_wait_secs == 0 {
            return Err(HubConfigError::Zero("write_wait_secs"));
        }
        if self.ping_interval_secs == 0 {
            return Err(HubConfigError::Zero("ping_interval_secs"));
        }
        if self.ping_interval_secs >= self.pong_wait_secs {
            return Err(HubConfigError::PingNotBeforeTimeout {
                ping: self.ping_interval_secs,
                pong: self.pong_wait_secs,
            });
        }
        Ok(())
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}
