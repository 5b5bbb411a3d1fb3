//! Client-to-server frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EnvelopeKind, UserId};

/// Errors raised while interpreting a client frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not valid JSON, or fields of the wrong type.
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// `type` names no known kind.
    #[error("unknown frame type: {0}")]
    UnknownKind(String),

    /// Kinds such as `user_online` are only ever produced by the hub.
    #[error("frame type {0} cannot be sent by clients")]
    ServerOnlyKind(EnvelopeKind),

    /// `private_message` without a `to` field.
    #[error("private_message requires a recipient")]
    MissingRecipient,
}

/// A frame as received from a client.
///
/// There is no `from`, `username` or `timestamp` here. Clients may send those
/// keys but they are ignored during decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    #[serde(default)]
    pub content: String,
}

/// What a well-formed client frame asks the hub to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    PrivateMessage { to: UserId, content: String },
    Broadcast { content: String },
}

impl ClientFrame {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Classify the frame. Anything a client is not allowed to send is an error.
    pub fn request(&self) -> Result<ClientRequest, FrameError> {
        let kind = self
            .kind
            .parse::<EnvelopeKind>()
            .map_err(|_| FrameError::UnknownKind(self.kind.clone()))?;

        if !kind.is_client_originated() {
            return Err(FrameError::ServerOnlyKind(kind));
        }

        if kind == EnvelopeKind::PrivateMessage {
            let to = self.to.ok_or(FrameError::MissingRecipient)?;
            Ok(ClientRequest::PrivateMessage {
                to,
                content: self.content.clone(),
            })
        } else {
            Ok(ClientRequest::Broadcast {
                content: self.content.clone(),
            })
        }
    }
}
