//! Wire protocol for the Agora messaging hub.
//!
//! Every WebSocket text frame carries exactly one JSON object. Frames sent by
//! the server are [`Envelope`]s; frames sent by clients are parsed as
//! [`ClientFrame`]s, which deliberately have no sender, username or timestamp
//! fields. Those are always stamped by the server.

mod envelope;
mod frame;

pub use envelope::{Envelope, EnvelopeKind, UnknownKind, server_timestamp};
pub use frame::{ClientFrame, ClientRequest, FrameError};

/// Numeric user identifier, as stored in the `users` table.
pub type UserId = i64;
