//! Server-to-client envelope.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::UserId;

/// Kind of an envelope, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Direct message to a single recipient.
    PrivateMessage,
    /// Message fanned out to every other connected user.
    Broadcast,
    /// A user came online.
    UserOnline,
    /// A user went offline.
    UserOffline,
    /// Echo of a private message back to its sender.
    MessageSent,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 5] = [
        EnvelopeKind::PrivateMessage,
        EnvelopeKind::Broadcast,
        EnvelopeKind::UserOnline,
        EnvelopeKind::UserOffline,
        EnvelopeKind::MessageSent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::PrivateMessage => "private_message",
            EnvelopeKind::Broadcast => "broadcast",
            EnvelopeKind::UserOnline => "user_online",
            EnvelopeKind::UserOffline => "user_offline",
            EnvelopeKind::MessageSent => "message_sent",
        }
    }

    /// Whether a client may send this kind. The rest are produced by the hub.
    pub fn is_client_originated(self) -> bool {
        matches!(self, EnvelopeKind::PrivateMessage | EnvelopeKind::Broadcast)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a `type` string names no known kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown envelope kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for EnvelopeKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvelopeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// A message as written to the wire by the server.
///
/// `from`, `username` and `timestamp` are always server-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub username: String,
    #[serde(with = "rfc3339_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Presence announcement for `user_id`.
    pub fn presence(online: bool, user_id: UserId, username: &str) -> Self {
        Self {
            kind: if online {
                EnvelopeKind::UserOnline
            } else {
                EnvelopeKind::UserOffline
            },
            from: user_id,
            to: None,
            content: String::new(),
            username: username.to_string(),
            timestamp: server_timestamp(),
        }
    }

    /// Copy of this envelope addressed back to its sender as `message_sent`.
    pub fn echo(&self) -> Self {
        Self {
            kind: EnvelopeKind::MessageSent,
            ..self.clone()
        }
    }

    /// Serialize to the JSON text carried by one WebSocket frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Current time at the precision carried on the wire.
pub fn server_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

mod rfc3339_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}
