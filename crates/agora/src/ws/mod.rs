//! Real-time connection hub.
//!
//! Each authenticated WebSocket becomes a [`connection::Connection`] with a
//! bounded mailbox and two pumps. A single [`Hub`] task owns the registry of
//! live connections and routes private messages, broadcasts and presence
//! announcements between them.

pub mod connection;
mod handler;
pub mod hub;
pub mod types;

pub use connection::{Connection, ConnectionHandle, DeliveryError};
pub use handler::ws_handler;
pub use hub::{Hub, HubHandle};
pub use types::{
    ConnectionId, ConnectionState, EvictReason, HubConfig, HubConfigError, HubError, Identity,
    Inbound,
};
