//! Message-rewriting extensions.

use bayeux_wire::Message;

/// An extension run on every inbound and outbound message.
///
/// Extensions may rewrite any field of the message. The engine restores the
/// outbound `id` after the extension chain runs, so replies can always be
/// correlated to their request. Returning `false` drops the message.
pub trait Extension: Send + Sync {
    /// Process an outgoing message before it reaches the transport.
    fn outgoing(&self, _message: &mut Message) -> bool {
        true
    }

    /// Process an incoming message before the engine classifies it.
    fn incoming(&self, _message: &mut Message) -> bool {
        true
    }
}
