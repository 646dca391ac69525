//! Pluggable client transports and transport negotiation.
//!
//! Transports are capabilities, not base classes: the engine holds the
//! currently negotiated transport in its state and swaps it under a state
//! transition. A transport carries whole message batches and reports
//! replies or failures through a [`TransportListener`].

use std::sync::Arc;

use bayeux_wire::Message;
use thiserror::Error;

/// Why a batch of messages failed to complete.
#[derive(Debug, Clone, Error)]
pub enum TransportFailure {
    /// The server could not be reached or the connection dropped.
    #[error("transport i/o failure: {0}")]
    Io(String),

    /// The server answered outside the Bayeux protocol.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    /// The reply payload could not be parsed.
    #[error("malformed reply: {0}")]
    Parse(String),

    /// The transport is terminated or was asked to abort.
    #[error("transport closed")]
    Closed,
}

/// Callback surface for the outcome of a transport send.
///
/// Implementations are invoked from whatever task performed the I/O; they
/// must not block.
pub trait TransportListener: Send + Sync {
    /// The given messages are about to hit the wire.
    fn on_sending(&self, _messages: &[Message]) {}

    /// Reply messages arrived, in wire order.
    fn on_messages(&self, messages: Vec<Message>);

    /// The exchange failed; `messages` is the batch that was being sent.
    fn on_failure(&self, failure: TransportFailure, messages: Vec<Message>);
}

/// A client transport able to carry Bayeux message batches.
pub trait Transport: Send + Sync {
    /// Wire name advertised during negotiation (e.g. `long-polling`).
    fn name(&self) -> &str;

    /// Whether this transport can serve the given protocol version and URL.
    ///
    /// Lets transports decline based on URL scheme or cross-origin
    /// constraints before negotiation considers them.
    fn accepts(&self, _version: &str, _url: &str) -> bool {
        true
    }

    /// Prepare the transport for use after it has been negotiated.
    fn init(&self) {}

    /// Send a batch of messages.
    ///
    /// The call must not block; replies and failures are delivered through
    /// `listener` from the transport's own tasks.
    fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>);

    /// Gracefully release resources.
    fn terminate(&self) {}

    /// Abruptly release resources. Defaults to [`Transport::terminate`].
    fn abort(&self) {
        self.terminate();
    }

    /// Install the listener for unsolicited server-to-client messages.
    ///
    /// Request/response transports deliver nothing here; full-duplex
    /// transports route server pushes that do not correlate to a pending
    /// exchange through this listener.
    fn set_message_listener(&self, _listener: Arc<dyn TransportListener>) {}
}

/// Ordered registry of the transports a client may use.
///
/// Registration order is the client's preference order during negotiation.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport. A transport with an already-known name is
    /// ignored.
    pub fn add(&mut self, transport: Arc<dyn Transport>) {
        if !self
            .transports
            .iter()
            .any(|known| known.name() == transport.name())
        {
            self.transports.push(transport);
        }
    }

    /// All registered transports, in preference order.
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Names of all registered transports.
    pub fn known_names(&self) -> Vec<String> {
        self.transports
            .iter()
            .map(|transport| transport.name().to_string())
            .collect()
    }

    /// Look up a transport by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|transport| transport.name() == name)
            .cloned()
    }

    /// The transports willing to serve the given version and URL, in
    /// preference order.
    pub fn allowed(&self, version: &str, url: &str) -> Vec<Arc<dyn Transport>> {
        self.transports
            .iter()
            .filter(|transport| transport.accepts(version, url))
            .cloned()
            .collect()
    }

    /// Intersect the allowed transports with a server-advertised list,
    /// preserving client preference order.
    pub fn negotiate(&self, server: &[String], version: &str, url: &str) -> Vec<Arc<dyn Transport>> {
        self.allowed(version, url)
            .into_iter()
            .filter(|transport| server.iter().any(|name| name == transport.name()))
            .collect()
    }
}
