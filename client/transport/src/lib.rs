//! Concrete wire transports for the Bayeux client.
//!
//! Two transports are provided:
//!
//! - **`long-polling`** ([`LongPollingTransport`]): each batch is POSTed as
//!   a JSON array over HTTP; the reply carries the response batch. Cookies
//!   are shared across requests through an in-memory jar.
//! - **`websocket`** ([`WebSocketTransport`]): batches travel as text
//!   frames over a single full-duplex connection; replies are correlated to
//!   their exchange by message id, and unsolicited server pushes are routed
//!   to the engine's message listener.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod long_polling;
pub mod websocket;

pub use error::TransportBuildError;
pub use long_polling::{LongPollingOptions, LongPollingTransport};
pub use websocket::WebSocketTransport;
