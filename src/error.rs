use thiserror::Error;

use crate::protocol::{RejectReason, ServerMessage};

/// Why an inbound frame did not produce a usable envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON. Dropped without a reply.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    /// Well-formed JSON that does not match any envelope shape.
    #[error("protocol violation: {0}")]
    Violation(String),
}

impl DecodeError {
    /// The notice a joined client receives for this error, if any.
    pub fn notice(&self) -> Option<ServerMessage> {
        match self {
            DecodeError::Malformed(_) => None,
            DecodeError::UnknownType(_) => Some(ServerMessage::error("unknown_type")),
            DecodeError::Violation(detail) => Some(ServerMessage::error(detail.clone())),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    #[error("invalid username")]
    InvalidName,

    #[error("username already taken")]
    NameTaken,
}

impl JoinError {
    pub fn reason(self) -> RejectReason {
        match self {
            JoinError::InvalidName => RejectReason::InvalidName,
            JoinError::NameTaken => RejectReason::UsernameTaken,
        }
    }
}

/// A frame could not be queued for a peer; the peer is treated as gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("peer outbox is full")]
    Full,

    #[error("peer connection is closed")]
    Closed,
}
