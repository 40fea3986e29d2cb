//! Signaling message types exchanged between browser peers via the relay.
//!
//! Peers send UTF-8 JSON objects carrying a `type` discriminator plus
//! optional `channel` and `userId` routing fields. Everything else in the
//! object is opaque to the relay and is forwarded verbatim, so [`decode`]
//! only extracts routing metadata into a [`SignalMessage`]; it never
//! re-encodes the payload.

use serde::Deserialize;
use serde_json::{Map, Value};

/// `type` value for joining a channel.
pub const JOIN_CHANNEL: &str = "join_channel";
/// `type` value for a call extension request.
pub const EXTENSION_REQUEST: &str = "extension_request";
/// `type` value for a call extension response.
pub const EXTENSION_RESPONSE: &str = "extension_response";
/// `type` value for a user report.
pub const USER_REPORT: &str = "user_report";

/// Errors produced while decoding an inbound signaling frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not a JSON object with a string `type` field.
    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A recognized message type is missing one of its required fields.
    ///
    /// Empty strings count as missing.
    #[error("{kind} message is missing required field `{field}`")]
    MissingField {
        /// The `type` value of the offending message.
        kind: &'static str,
        /// Wire name of the missing field.
        field: &'static str,
    },

    /// A required field is present but is not a string.
    #[error("{kind} message has non-string field `{field}`")]
    InvalidField {
        /// The `type` value of the offending message.
        kind: &'static str,
        /// Wire name of the mistyped field.
        field: &'static str,
    },
}

/// A decoded signaling message.
///
/// Each variant carries exactly the routing fields the relay needs. The
/// original payload text stays with the caller for verbatim forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    /// Peer joins a channel and becomes eligible for forwarded messages.
    JoinChannel {
        /// Channel to join.
        channel: String,
        /// Application-level user id of the joining peer.
        user_id: String,
    },

    /// Ask the other participants to extend the current call.
    ExtensionRequest {
        /// Channel whose other members receive the message.
        channel: String,
    },

    /// Answer to an [`SignalMessage::ExtensionRequest`].
    ExtensionResponse {
        /// Channel whose other members receive the message.
        channel: String,
    },

    /// Abuse report about another participant, kept for manual review.
    UserReport {
        /// Reporter's user id, when the payload names one.
        user_id: Option<String>,
    },

    /// Any `type` the relay does not handle.
    Unrecognized {
        /// The unrecognized `type` value.
        kind: String,
    },
}

impl SignalMessage {
    /// Returns the wire `type` value of this message.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::JoinChannel { .. } => JOIN_CHANNEL,
            Self::ExtensionRequest { .. } => EXTENSION_REQUEST,
            Self::ExtensionResponse { .. } => EXTENSION_RESPONSE,
            Self::UserReport { .. } => USER_REPORT,
            Self::Unrecognized { kind } => kind.as_str(),
        }
    }

    /// Returns the channel this message is fanned out to, if it is a
    /// forwarded message type.
    #[must_use]
    pub fn forward_channel(&self) -> Option<&str> {
        match self {
            Self::ExtensionRequest { channel } | Self::ExtensionResponse { channel } => {
                Some(channel.as_str())
            }
            _ => None,
        }
    }
}

/// Routing fields read from every inbound object. Unknown fields are ignored.
///
/// Only `type` is typed strictly. `channel` and `userId` are checked by the
/// variants that need them, so a stray value of another type never blocks a
/// message that does not route on it.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<Value>,
    #[serde(default, rename = "userId")]
    user_id: Option<Value>,
}

/// Decodes a raw text frame into a [`SignalMessage`].
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] if the text is not a JSON object with a
/// string `type`, [`DecodeError::MissingField`] if a recognized type lacks a
/// required field, or [`DecodeError::InvalidField`] if that field is not a
/// string.
pub fn decode(raw: &str) -> Result<SignalMessage, DecodeError> {
    // Going through `Map` rejects arrays, which serde would otherwise accept
    // as a positional encoding of `Envelope`.
    let object: Map<String, Value> = serde_json::from_str(raw)?;
    let envelope = Envelope::deserialize(Value::Object(object))?;

    let msg = match envelope.kind.as_str() {
        JOIN_CHANNEL => SignalMessage::JoinChannel {
            channel: required(envelope.channel, JOIN_CHANNEL, "channel")?,
            user_id: required(envelope.user_id, JOIN_CHANNEL, "userId")?,
        },
        EXTENSION_REQUEST => SignalMessage::ExtensionRequest {
            channel: required(envelope.channel, EXTENSION_REQUEST, "channel")?,
        },
        EXTENSION_RESPONSE => SignalMessage::ExtensionResponse {
            channel: required(envelope.channel, EXTENSION_RESPONSE, "channel")?,
        },
        USER_REPORT => SignalMessage::UserReport {
            user_id: match envelope.user_id {
                Some(Value::String(id)) if !id.is_empty() => Some(id),
                _ => None,
            },
        },
        _ => SignalMessage::Unrecognized {
            kind: envelope.kind,
        },
    };
    Ok(msg)
}

fn required(
    value: Option<Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<String, DecodeError> {
    match value {
        Some(Value::String(v)) if !v.is_empty() => Ok(v),
        None | Some(Value::Null | Value::String(_)) => {
            Err(DecodeError::MissingField { kind, field })
        }
        Some(_) => Err(DecodeError::InvalidField { kind, field }),
    }
}
