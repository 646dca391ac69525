//! Bayeux 1.0 wire model: message envelopes, channel ids, and server advice.
//!
//! This crate provides the protocol-level data model shared by the session
//! engine and the transports:
//!
//! - **Message envelope**: the mutable JSON object exchanged with the server,
//!   with the recognized Bayeux fields typed and everything else preserved
//! - **Channel ids**: hierarchical `/a/b/c` paths with meta/service
//!   classification and `*`/`**` glob matching
//! - **Advice**: the server-supplied reconnect guidance attached to replies
//!
//! The crate is codec-agnostic beyond JSON: messages serialize with stable
//! field ordering so that a parse/re-serialize round trip is byte-equal.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod advice;
pub mod channel;
pub mod error;
pub mod message;

pub use advice::{Advice, Reconnect};
pub use channel::{
    ChannelId, META_CONNECT, META_DISCONNECT, META_HANDSHAKE, META_SUBSCRIBE, META_UNSUBSCRIBE,
};
pub use error::MessageError;
pub use message::{Failure, Message};
