use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, JoinError};

/// Recipient value that addresses every online user.
pub const BROADCAST_TARGET: &str = "all";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CLIENT_TYPES: &[&str] = &["join", "message", "list_request", "quit"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        #[serde(default, alias = "username", deserialize_with = "name_or_none")]
        from: Option<String>,
    },
    Message {
        #[serde(default = "broadcast_target")]
        to: String,
        msg: String,
    },
    ListRequest,
    Quit,
}

fn broadcast_target() -> String {
    BROADCAST_TARGET.to_string()
}

// A name that is not a string reads as no name, so the join fails validation.
fn name_or_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(name) => Some(name),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidName,
    UsernameTaken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JoinAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    System {
        msg: String,
        time: String,
    },
    Message {
        from: String,
        to: String,
        msg: String,
        time: String,
    },
    OnlineList {
        users: Vec<String>,
    },
    Error {
        msg: String,
    },
}

impl ServerMessage {
    pub fn accepted() -> Self {
        ServerMessage::JoinAck {
            ok: true,
            reason: None,
            time: Some(now()),
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        ServerMessage::JoinAck {
            ok: false,
            reason: Some(reason),
            time: None,
        }
    }

    pub fn system<S: Into<String>>(msg: S) -> Self {
        ServerMessage::System {
            msg: msg.into(),
            time: now(),
        }
    }

    pub fn chat(from: &str, to: &str, msg: String) -> Self {
        ServerMessage::Message {
            from: from.to_string(),
            to: to.to_string(),
            msg,
            time: now(),
        }
    }

    pub fn error<S: Into<String>>(msg: S) -> Self {
        ServerMessage::Error { msg: msg.into() }
    }
}

/// Server-side timestamp attached to outbound envelopes.
pub fn now() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

/// Decodes one frame into a client envelope.
///
/// Invalid JSON is reported as [`DecodeError::Malformed`] so callers can drop
/// it silently; JSON that is not a known envelope is a type or shape error.
pub fn decode(frame: &[u8]) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_slice(frame).map_err(DecodeError::Malformed)?;

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(DecodeError::Violation("type must be a string".into())),
        None => return Err(DecodeError::Violation("missing field `type`".into())),
    };

    if !CLIENT_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }

    ClientMessage::deserialize(value).map_err(|err| DecodeError::Violation(err.to_string()))
}

/// Normalizes a requested username, rejecting names nobody could address.
pub fn validate_name(requested: Option<&str>, max_len: usize) -> Result<String, JoinError> {
    let name = requested.map(str::trim).unwrap_or_default();

    if name.is_empty()
        || name.chars().count() > max_len
        || name.chars().any(char::is_control)
        || name == BROADCAST_TARGET
    {
        return Err(JoinError::InvalidName);
    }

    Ok(name.to_string())
}
