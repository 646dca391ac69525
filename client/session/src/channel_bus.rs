//! Channel subscriptions, listeners, and glob dispatch.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, error};

use bayeux_wire::{ChannelId, Message};

use crate::client::MessageCallback;

/// Identifies a registration so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    callback: MessageCallback,
    /// Listeners survive handshakes; subscriptions are cleared.
    listener: bool,
}

/// Maps channel names (possibly globs) to ordered registrations and fans
/// incoming messages out to them.
///
/// Registration order is preserved per channel so dispatch is
/// deterministic. Mutations are serialized; dispatch snapshots the matching
/// callbacks and invokes them outside the lock, so callbacks may freely
/// re-enter the bus.
#[derive(Default)]
pub(crate) struct ChannelBus {
    channels: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl ChannelBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a callback; returns its id and the number of non-listener
    /// registrations now present on the channel.
    pub(crate) fn register(
        &self,
        channel: &str,
        callback: MessageCallback,
        listener: bool,
    ) -> (SubscriptionId, usize) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels.write();
        let registrations = channels.entry(channel.to_string()).or_default();
        registrations.push(Registration {
            id,
            callback,
            listener,
        });
        let subscribers = registrations.iter().filter(|r| !r.listener).count();
        (id, subscribers)
    }

    /// Remove a registration; returns the number of non-listener
    /// registrations left on the channel, or `None` when the id was not
    /// registered there.
    pub(crate) fn unregister(&self, channel: &str, id: SubscriptionId) -> Option<usize> {
        let mut channels = self.channels.write();
        let registrations = channels.get_mut(channel)?;
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        if registrations.len() == before {
            return None;
        }
        let subscribers = registrations.iter().filter(|r| !r.listener).count();
        if registrations.is_empty() {
            channels.remove(channel);
        }
        Some(subscribers)
    }

    /// Number of non-listener registrations on a channel.
    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|registrations| registrations.iter().filter(|r| !r.listener).count())
            .unwrap_or(0)
    }

    /// Drop every subscription, keeping listeners.
    pub(crate) fn clear_subscriptions(&self) {
        let mut channels = self.channels.write();
        channels.retain(|_, registrations| {
            registrations.retain(|r| r.listener);
            !registrations.is_empty()
        });
    }

    /// Dispatch a message to the exact channel and its matching globs.
    pub(crate) fn notify(&self, message: &Message) {
        let channel = match ChannelId::parse(&message.channel) {
            Ok(channel) => channel,
            Err(_) => {
                debug!("dropping message with invalid channel {:?}", message.channel);
                return;
            }
        };

        let mut targets = vec![channel.as_str().to_string()];
        targets.extend(channel.wilds());

        let callbacks: Vec<MessageCallback> = {
            let channels = self.channels.read();
            targets
                .iter()
                .filter_map(|name| channels.get(name))
                .flat_map(|registrations| registrations.iter().map(|r| r.callback.clone()))
                .collect()
        };

        for callback in callbacks {
            invoke_callback(&callback, message);
        }
    }
}

/// Invoke a callback, isolating the engine from panics.
///
/// A panicking listener is logged and does not abort dispatch to the
/// remaining listeners.
pub(crate) fn invoke_callback(callback: &MessageCallback, message: &Message) {
    if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
        error!("listener panicked handling {}", message.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    fn delivery(channel: &str) -> Message {
        Message::new(channel)
    }

    #[test]
    fn test_dispatch_order_exact_then_globs() {
        let bus = ChannelBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, channel) in [
            ("deep", "/a/**"),
            ("root", "/**"),
            ("exact", "/a/b"),
            ("shallow", "/a/*"),
        ] {
            let order = order.clone();
            bus.register(
                channel,
                Arc::new(move |_: &Message| order.lock().unwrap().push(label)),
                false,
            );
        }

        bus.notify(&delivery("/a/b"));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["exact", "shallow", "deep", "root"]
        );
    }

    #[test]
    fn test_registration_order_preserved_per_channel() {
        let bus = ChannelBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            bus.register(
                "/chat",
                Arc::new(move |_: &Message| order.lock().unwrap().push(label)),
                false,
            );
        }
        bus.notify(&delivery("/chat"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_clear_keeps_listeners() {
        let bus = ChannelBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        bus.register(
            "/chat",
            Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
        let counter = calls.clone();
        bus.register(
            "/chat",
            Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );

        assert_eq!(bus.subscriber_count("/chat"), 1);
        bus.clear_subscriptions();
        assert_eq!(bus.subscriber_count("/chat"), 0);

        bus.notify(&delivery("/chat"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_crossing() {
        let bus = ChannelBus::new();
        let noop: MessageCallback = Arc::new(|_: &Message| {});
        let (first, count) = bus.register("/chat", noop.clone(), false);
        assert_eq!(count, 1);
        let (second, count) = bus.register("/chat", noop.clone(), false);
        assert_eq!(count, 2);

        assert_eq!(bus.unregister("/chat", first), Some(1));
        assert_eq!(bus.unregister("/chat", second), Some(0));
        assert_eq!(bus.unregister("/chat", second), None);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_dispatch() {
        let bus = ChannelBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.register(
            "/chat",
            Arc::new(|_: &Message| panic!("listener bug")),
            false,
        );
        let counter = calls.clone();
        bus.register(
            "/chat",
            Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );

        bus.notify(&delivery("/chat"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
