//! The mutable Bayeux message envelope.
//!
//! Messages are JSON objects. The fields the protocol recognizes are typed
//! below; any other field (handshake template entries, extension payloads)
//! is preserved in the `extra` map across a parse/serialize round trip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::advice::Advice;
use crate::channel::ChannelId;
use crate::error::MessageError;

/// A Bayeux message, mutable while in flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Client-assigned exchange id, unique within a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The channel this message belongs to.
    pub channel: String,
    /// Session id assigned by the server on a successful handshake.
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// The transport carrying a `/meta/connect`.
    #[serde(rename = "connectionType", skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    /// Outcome flag on replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    /// Target channel of a `/meta/subscribe` or `/meta/unsubscribe`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    /// Application payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Server guidance for retry behavior.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    /// Transport names, ordered by preference.
    #[serde(
        rename = "supportedConnectionTypes",
        skip_serializing_if = "Option::is_none"
    )]
    pub supported_connection_types: Option<Vec<String>>,
    /// Protocol version spoken by the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Minimum protocol version the sender accepts.
    #[serde(rename = "minimumVersion", skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    /// Error description on failed replies (`code:args:message`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Extension payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    /// Diagnostic attached to synthesized failure replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Unrecognized fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Message {
    /// Create an empty message for the given channel.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Whether this is a reply marked successful.
    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Whether this message is a reply at all (solicited or synthesized).
    pub fn is_reply(&self) -> bool {
        self.successful.is_some()
    }

    /// Whether the channel is a `/meta/*` channel.
    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }

    /// Parse the channel name.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::InvalidChannel`] for malformed channel names.
    pub fn channel_id(&self) -> Result<ChannelId, MessageError> {
        ChannelId::parse(&self.channel)
    }
}

/// Diagnostic describing why a message could not complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable description of the underlying error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// Name of the transport that was carrying the message.
    #[serde(rename = "connectionType", skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    /// The request message that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<Message>>,
}

/// Parse a JSON batch of messages.
///
/// # Errors
///
/// Returns [`MessageError::Json`] when the payload is not a JSON array of
/// message objects.
pub fn parse_batch(bytes: &[u8]) -> Result<Vec<Message>, MessageError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize a batch of messages to JSON.
///
/// # Errors
///
/// Returns [`MessageError::Json`] when a payload value cannot be serialized.
pub fn encode_batch(messages: &[Message]) -> Result<Vec<u8>, MessageError> {
    Ok(serde_json::to_vec(messages)?)
}
