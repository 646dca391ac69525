//! Client-side Bayeux session engine.
//!
//! This crate implements the protocol engine of a Bayeux client: a
//! long-lived session that performs the handshake/connect/disconnect
//! exchanges, multiplexes application publish/subscribe traffic over them,
//! survives transient transport failures through advice-driven
//! reconnection, and dispatches server-pushed messages to channel
//! listeners.
//!
//! ## Features
//!
//! - **State machine**: eight lifecycle states with a fixed legal-transition
//!   graph, applied atomically under concurrency
//! - **Reconnection**: server advice (`retry`/`handshake`/`none`) combined
//!   with growing backoff decides between connect retries, re-handshakes,
//!   and termination
//! - **Pluggable transports**: negotiation between a client preference
//!   order and the server-advertised list, with queuing while suspended
//! - **Channel bus**: glob-capable subscription dispatch with deterministic
//!   ordering
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bayeux_session::{BayeuxClient, State, Transport};
//!
//! # async fn example(transport: Arc<dyn Transport>) {
//! let client = BayeuxClient::new("http://localhost:8080/cometd", vec![transport]);
//! client.handshake();
//! if client.wait_for(Duration::from_secs(5), &[State::Connected]).await {
//!     client.subscribe("/chat", Arc::new(|message| {
//!         println!("received: {:?}", message.data);
//!     }));
//!     client.publish("/chat", serde_json::json!({"text": "hello"}));
//! }
//! client.disconnect();
//! client.wait_for(Duration::from_secs(5), &[State::Disconnected]).await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel_bus;
pub mod client;
pub mod extension;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use channel_bus::SubscriptionId;
pub use client::{BayeuxClient, ClientOptions, MessageCallback, BAYEUX_VERSION};
pub use extension::Extension;
pub use queue::MessageQueue;
pub use scheduler::{ScheduledAction, Scheduler};
pub use state::{HandshakeFields, State};
pub use transport::{Transport, TransportFailure, TransportListener, TransportRegistry};

pub use bayeux_wire::{Advice, ChannelId, Failure, Message, Reconnect};
