//! The Bayeux session engine.
//!
//! [`BayeuxClient`] drives a long-lived session against a Bayeux server:
//! handshake/connect/disconnect exchanges, application publish/subscribe
//! traffic multiplexed over them, reconnection steered by server advice,
//! and dispatch of server-pushed messages to channel listeners.
//!
//! The engine is invoked concurrently from application threads, transport
//! tasks delivering replies, and the scheduler firing timed actions. State
//! transitions are serialized through the state machine and never block on
//! I/O; all I/O runs on tasks owned by the transports and the scheduler,
//! so every method here must be called from within a tokio runtime.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use bayeux_wire::{
    Advice, Failure, Message, Reconnect, META_CONNECT, META_DISCONNECT, META_HANDSHAKE,
    META_SUBSCRIBE, META_UNSUBSCRIBE,
};

use crate::channel_bus::{invoke_callback, ChannelBus, SubscriptionId};
use crate::extension::Extension;
use crate::queue::MessageQueue;
use crate::scheduler::{ScheduledAction, Scheduler};
use crate::state::{HandshakeFields, SessionState, State, StateMachine};
use crate::transport::{Transport, TransportFailure, TransportListener, TransportRegistry};

/// The Bayeux protocol version this client speaks.
pub const BAYEUX_VERSION: &str = "1.0";

/// Handshake template fields that the engine owns and a template must not
/// overwrite.
const RESERVED_HANDSHAKE_FIELDS: [&str; 5] = [
    "id",
    "channel",
    "supportedConnectionTypes",
    "version",
    "minimumVersion",
];

/// Callback invoked with a received or synthesized message.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Client-side tuning options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Pause added to the retry pause after each failed attempt.
    pub backoff_increment: Duration,
    /// Upper bound for the retry pause.
    pub max_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            backoff_increment: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

/// A client session against a Bayeux server.
///
/// Cloning is cheap and shares the session.
#[derive(Clone)]
pub struct BayeuxClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: String,
    options: ClientOptions,
    registry: TransportRegistry,
    machine: StateMachine,
    queue: MessageQueue,
    bus: ChannelBus,
    /// One-shot callbacks keyed by outbound message id.
    callbacks: DashMap<String, MessageCallback>,
    /// Pending remote-call timeouts keyed by message id.
    remote_timeouts: DashMap<String, ScheduledAction>,
    extensions: RwLock<Vec<Arc<dyn Extension>>>,
    batch_depth: AtomicUsize,
    next_message_id: AtomicU64,
    scheduler: Scheduler,
    owns_scheduler: bool,
    /// The single pending handshake-or-connect slot.
    pending_action: Mutex<Option<ScheduledAction>>,
}

/// Which exchange a transport listener belongs to.
#[derive(Debug, Clone, Copy)]
enum ReplyKind {
    Handshake,
    Connect,
    Disconnect,
    Publish,
}

struct ReplyListener {
    client: Weak<ClientInner>,
    kind: ReplyKind,
}

impl TransportListener for ReplyListener {
    fn on_messages(&self, messages: Vec<Message>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        for message in messages {
            match (self.kind, message.channel.as_str()) {
                (ReplyKind::Handshake, META_HANDSHAKE) => client.process_handshake(message),
                (ReplyKind::Connect, META_CONNECT) => client.process_connect(message),
                // Server-initiated disconnects can arrive on any exchange.
                (_, META_DISCONNECT) => client.process_disconnect(message),
                _ => client.receive(message),
            }
        }
    }

    fn on_failure(&self, failure: TransportFailure, messages: Vec<Message>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        debug!("messages failed ({}): {failure}", messages.len());
        match self.kind {
            ReplyKind::Handshake => client.handshake_failed(),
            ReplyKind::Connect => client.connect_failed(),
            ReplyKind::Disconnect => client.disconnect_failed(),
            ReplyKind::Publish => {}
        }
        client.fail_messages(&failure, messages);
    }
}

impl BayeuxClient {
    /// Create a client for `url` with default options and an owned
    /// scheduler.
    ///
    /// # Panics
    ///
    /// Panics when `transports` is empty.
    pub fn new(url: impl Into<String>, transports: Vec<Arc<dyn Transport>>) -> Self {
        Self::with_options(url, ClientOptions::default(), None, transports)
    }

    /// Create a client with explicit options and an optionally shared
    /// scheduler.
    ///
    /// When `scheduler` is `None` the client constructs its own and shuts
    /// it down on terminate; an injected scheduler is left running.
    ///
    /// # Panics
    ///
    /// Panics when `transports` is empty.
    pub fn with_options(
        url: impl Into<String>,
        options: ClientOptions,
        scheduler: Option<Scheduler>,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        assert!(!transports.is_empty(), "at least one transport is required");

        let mut registry = TransportRegistry::new();
        for transport in transports {
            registry.add(transport);
        }

        let (scheduler, owns_scheduler) = match scheduler {
            Some(shared) => (shared, false),
            None => (Scheduler::new(), true),
        };

        let inner = Arc::new(ClientInner {
            url: url.into(),
            options,
            registry,
            machine: StateMachine::new(SessionState::Disconnected { transport: None }),
            queue: MessageQueue::new(),
            bus: ChannelBus::new(),
            callbacks: DashMap::new(),
            remote_timeouts: DashMap::new(),
            extensions: RwLock::new(Vec::new()),
            batch_depth: AtomicUsize::new(0),
            next_message_id: AtomicU64::new(0),
            scheduler,
            owns_scheduler,
            pending_action: Mutex::new(None),
        });

        // Full-duplex transports route unsolicited server pushes through
        // the publish listener.
        let message_listener: Arc<dyn TransportListener> = Arc::new(ReplyListener {
            client: Arc::downgrade(&inner),
            kind: ReplyKind::Publish,
        });
        for transport in inner.registry.transports() {
            transport.set_message_listener(message_listener.clone());
        }

        Self { inner }
    }

    /// The server URL this client was built for.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.machine.current_kind()
    }

    /// The server-assigned session id, when handshook.
    pub fn client_id(&self) -> Option<String> {
        self.inner
            .machine
            .snapshot()
            .client_id()
            .map(str::to_string)
    }

    /// Whether the session is currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Whether the session has completed a handshake and still holds it.
    pub fn is_handshook(&self) -> bool {
        matches!(
            self.state(),
            State::Connecting | State::Connected | State::Unconnected
        )
    }

    /// Whether the session is disconnecting or disconnected.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self.state(),
            State::Disconnecting | State::Terminating | State::Disconnected
        )
    }

    /// Append an extension to the processing chain.
    pub fn add_extension(&self, extension: Arc<dyn Extension>) {
        self.inner.extensions.write().push(extension);
    }

    /// Start a handshake with no template and no callback.
    pub fn handshake(&self) {
        self.handshake_with(None, None);
    }

    /// Start a handshake, merging `template` into the handshake message and
    /// invoking `callback` with every handshake reply.
    ///
    /// Template fields never overwrite the reserved protocol fields.
    pub fn handshake_with(
        &self,
        template: Option<HandshakeFields>,
        callback: Option<MessageCallback>,
    ) {
        let inner = &self.inner;
        let allowed = inner.registry.allowed(BAYEUX_VERSION, &inner.url);
        assert!(
            !allowed.is_empty(),
            "no registered transport accepts {}",
            inner.url
        );
        // Pick the first transport for the handshake; the reply
        // renegotiates if it is not right.
        let initial = allowed[0].clone();
        debug!(
            "using initial transport {} from {:?}",
            initial.name(),
            inner.registry.known_names()
        );
        inner.prepare_transport(None, &initial);

        inner.update_state(
            |_| {
                Some(SessionState::Handshaking {
                    fields: template,
                    callback,
                    transport: initial,
                })
            },
            |_| {},
        );
    }

    /// Wait until the session state implies one of `targets`.
    ///
    /// Returns false when `timeout` elapses first.
    pub async fn wait_for(&self, timeout: Duration, targets: &[State]) -> bool {
        self.inner.machine.wait_for(timeout, targets).await
    }

    /// Publish `data` on an application channel.
    ///
    /// # Panics
    ///
    /// Panics when `channel` is malformed or a meta channel.
    pub fn publish(&self, channel: &str, data: Value) {
        self.publish_with(channel, data, None);
    }

    /// Publish with a callback invoked on the publish reply (or synthesized
    /// failure).
    ///
    /// # Panics
    ///
    /// Panics when `channel` is malformed or a meta channel.
    pub fn publish_with(&self, channel: &str, data: Value, callback: Option<MessageCallback>) {
        let channel_id = bayeux_wire::ChannelId::parse(channel).expect("invalid channel");
        assert!(
            !channel_id.is_meta(),
            "cannot publish on meta channel {channel}"
        );

        let mut message = Message::new(channel);
        let id = self.inner.next_message_id();
        message.id = Some(id.clone());
        message.data = Some(data);
        if let Some(callback) = callback {
            self.inner.callbacks.insert(id, callback);
        }
        self.inner.enqueue_send(message);
    }

    /// Subscribe to a channel.
    ///
    /// A `/meta/subscribe` is sent only when this is the first local
    /// subscriber of the channel.
    ///
    /// # Panics
    ///
    /// Panics when `channel` is malformed or a meta channel, or when called
    /// before the first handshake.
    pub fn subscribe(&self, channel: &str, callback: MessageCallback) -> SubscriptionId {
        self.subscribe_with(channel, callback, None)
    }

    /// Subscribe with a callback invoked on the `/meta/subscribe` reply.
    ///
    /// # Panics
    ///
    /// See [`BayeuxClient::subscribe`].
    pub fn subscribe_with(
        &self,
        channel: &str,
        callback: MessageCallback,
        reply_callback: Option<MessageCallback>,
    ) -> SubscriptionId {
        let channel_id = bayeux_wire::ChannelId::parse(channel).expect("invalid channel");
        assert!(
            !channel_id.is_meta(),
            "cannot subscribe to meta channel {channel}; use add_listener"
        );
        assert!(
            self.state() != State::Disconnected,
            "cannot subscribe before handshake"
        );

        let (subscription, subscribers) = self.inner.bus.register(channel, callback, false);
        if subscribers == 1 {
            let mut message = Message::new(META_SUBSCRIBE);
            let id = self.inner.next_message_id();
            message.id = Some(id.clone());
            message.subscription = Some(channel.to_string());
            if let Some(reply_callback) = reply_callback {
                self.inner.callbacks.insert(id, reply_callback);
            }
            self.inner.enqueue_send(message);
        }
        subscription
    }

    /// Remove a subscription; sends `/meta/unsubscribe` when the channel
    /// loses its last local subscriber.
    pub fn unsubscribe(&self, channel: &str, subscription: SubscriptionId) {
        if let Some(remaining) = self.inner.bus.unregister(channel, subscription) {
            if remaining == 0 {
                let mut message = Message::new(META_UNSUBSCRIBE);
                message.id = Some(self.inner.next_message_id());
                message.subscription = Some(channel.to_string());
                self.inner.enqueue_send(message);
            }
        }
    }

    /// Register a permanent listener. Listeners survive handshakes and may
    /// observe meta channels; no `/meta/subscribe` is sent.
    pub fn add_listener(&self, channel: &str, callback: MessageCallback) -> SubscriptionId {
        self.inner.bus.register(channel, callback, true).0
    }

    /// Remove a listener registered with [`BayeuxClient::add_listener`].
    pub fn remove_listener(&self, channel: &str, listener: SubscriptionId) {
        self.inner.bus.unregister(channel, listener);
    }

    /// Send a request to `/service/<target>` and invoke `callback` with the
    /// reply, or with a synthesized `406::timeout` failure after `timeout`.
    pub fn remote_call(
        &self,
        target: &str,
        data: Value,
        timeout: Duration,
        callback: MessageCallback,
    ) {
        let channel = format!("/service/{}", target.trim_start_matches('/'));
        let mut message = Message::new(channel.as_str());
        let id = self.inner.next_message_id();
        message.id = Some(id.clone());
        message.data = Some(data);
        self.inner.callbacks.insert(id.clone(), callback);

        if !timeout.is_zero() {
            let client = self.inner.clone();
            let message_id = id.clone();
            if let Some(action) = self.inner.scheduler.schedule(timeout, move || {
                client.remote_timeouts.remove(&message_id);
                // Only fail the call if the reply has not consumed the
                // callback already.
                if let Some((_, callback)) = client.callbacks.remove(&message_id) {
                    let mut failed = Message::new(channel.as_str());
                    failed.id = Some(message_id.clone());
                    failed.successful = Some(false);
                    failed.error = Some("406::timeout".to_string());
                    invoke_callback(&callback, &failed);
                }
            }) {
                self.inner.remote_timeouts.insert(id, action);
            }
        }
        self.inner.enqueue_send(message);
    }

    /// Open a batch. Messages published until the matching
    /// [`BayeuxClient::end_batch`] are held and flushed together.
    pub fn start_batch(&self) {
        self.inner.batch_depth.fetch_add(1, Ordering::SeqCst);
    }

    /// Close a batch; the outermost close flushes the queue.
    ///
    /// # Panics
    ///
    /// Panics when no batch is open.
    pub fn end_batch(&self) {
        let previous = self
            .inner
            .batch_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                depth.checked_sub(1)
            });
        match previous {
            Ok(1) => self.inner.send_batch(),
            Ok(_) => {}
            Err(_) => panic!("unbalanced end_batch"),
        }
    }

    /// Run `operation` inside a batch.
    pub fn batch(&self, operation: impl FnOnce()) {
        self.start_batch();
        operation();
        self.end_batch();
    }

    /// Disconnect gracefully.
    pub fn disconnect(&self) {
        self.disconnect_with(None);
    }

    /// Disconnect gracefully, invoking `callback` with the disconnect
    /// reply.
    pub fn disconnect_with(&self, callback: Option<MessageCallback>) {
        self.inner.update_state(
            |old| match old.kind() {
                State::Connecting | State::Connected | State::Disconnecting => {
                    Some(SessionState::Disconnecting {
                        callback,
                        transport: old.transport()?.clone(),
                        client_id: old.client_id()?.to_string(),
                    })
                }
                _ => Some(SessionState::Terminating {
                    transport: old.transport()?.clone(),
                    abort: false,
                }),
            },
            |_| {},
        );
    }

    /// Interrupt the session abruptly, without a disconnect exchange.
    pub fn abort(&self) {
        self.inner.update_state(
            |old| {
                Some(SessionState::Terminating {
                    transport: old.transport()?.clone(),
                    abort: true,
                })
            },
            |_| {},
        );
    }
}

impl ClientInner {
    fn next_message_id(&self) -> String {
        (self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn next_backoff(&self, old: &SessionState) -> u64 {
        let increment = self.options.backoff_increment.as_millis() as u64;
        let max = self.options.max_backoff.as_millis() as u64;
        (old.backoff() + increment).min(max)
    }

    fn prepare_transport(&self, old: Option<&Arc<dyn Transport>>, new: &Arc<dyn Transport>) {
        if let Some(old) = old {
            old.terminate();
        }
        new.init();
    }

    /// Apply a state update with the hook order of the engine: swap, then
    /// the post-create side effect (which runs exactly once, applied or
    /// not), then `enter` when the tag changed, then `run` once waiters
    /// have been released.
    fn update_state<P, S>(self: &Arc<Self>, propose: P, post: S)
    where
        P: FnOnce(&SessionState) -> Option<SessionState>,
        S: FnOnce(&Arc<Self>),
    {
        self.machine.begin();
        let applied = self.machine.try_apply(propose);
        post(self);
        if let Some(applied) = &applied {
            if applied.old != applied.snapshot.kind() {
                self.on_enter(applied.old, &applied.snapshot);
            }
        }
        self.machine.end();
        if let Some(applied) = applied {
            self.on_run(&applied.snapshot);
        }
    }

    /// Entering side effects, fired only when the state tag changed.
    fn on_enter(self: &Arc<Self>, old: State, new: &SessionState) {
        match new.kind() {
            // A requested handshake always resets subscriptions.
            State::Handshaking => self.bus.clear_subscriptions(),
            // A rehandshake resets them unless it directly follows a
            // requested handshake, whose subscriptions may be queued.
            State::Rehandshaking if old != State::Handshaking => self.bus.clear_subscriptions(),
            _ => {}
        }
    }

    /// Running side effects, fired on every applied update.
    fn on_run(self: &Arc<Self>, state: &SessionState) {
        let interval = state.advice().map(Advice::interval_ms).unwrap_or(0);
        match state {
            SessionState::Disconnected { .. } => {}
            SessionState::Handshaking { .. } => self.send_handshake(),
            SessionState::Rehandshaking { backoff, .. } => {
                self.schedule_handshake(interval, *backoff);
            }
            SessionState::Connecting { .. } => {
                // Flush messages that queued up while the handshake was in
                // flight, then start the connect rhythm.
                self.send_batch();
                self.schedule_connect(interval, 0);
            }
            SessionState::Connected { .. } => self.schedule_connect(interval, 0),
            SessionState::Unconnected {
                advice,
                backoff,
                since,
                ..
            } => {
                let max_interval = advice.as_ref().map(Advice::max_interval_ms).unwrap_or(0);
                if max_interval > 0 {
                    let timeout = advice.as_ref().map(Advice::timeout_ms).unwrap_or(0);
                    let expiration = timeout + interval + max_interval;
                    let unconnected = since.elapsed().as_millis() as u64;
                    // The server has likely forgotten the session; retrying
                    // connects cannot succeed any more.
                    if unconnected + backoff > expiration {
                        debug!("switching to handshake retries");
                        self.schedule_handshake(interval, *backoff);
                        return;
                    }
                }
                self.schedule_connect(interval, *backoff);
            }
            SessionState::Disconnecting { callback, .. } => self.send_disconnect(callback.clone()),
            SessionState::Terminating { transport, abort } => {
                self.terminate(transport.clone(), *abort);
            }
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration, action: impl FnOnce() + Send + 'static) {
        let mut pending = self.pending_action.lock();
        // At most one handshake-or-connect action may be pending.
        if let Some(previous) = pending.take() {
            previous.cancel();
        }
        match self.scheduler.schedule(delay, action) {
            Some(action) => *pending = Some(action),
            None => debug!("scheduler is shut down, action dropped"),
        }
    }

    fn schedule_handshake(self: &Arc<Self>, interval: u64, backoff: u64) {
        let client = self.clone();
        self.schedule(Duration::from_millis(interval + backoff), move || {
            client.send_handshake();
        });
    }

    fn schedule_connect(self: &Arc<Self>, interval: u64, backoff: u64) {
        let client = self.clone();
        self.schedule(Duration::from_millis(interval + backoff), move || {
            client.send_connect();
        });
    }

    fn send_handshake(self: &Arc<Self>) {
        let snapshot = self.machine.snapshot();
        // The state may have moved between scheduling and firing; in that
        // case the handshake is simply not sent.
        if !matches!(
            snapshot.kind(),
            State::Handshaking | State::Rehandshaking | State::Unconnected
        ) {
            return;
        }

        let mut message = Message::new(META_HANDSHAKE);
        if let Some(fields) = snapshot.handshake_fields() {
            for (key, value) in fields {
                if !RESERVED_HANDSHAKE_FIELDS.contains(&key.as_str()) {
                    message.extra.insert(key.clone(), value.clone());
                }
            }
        }
        let id = self.next_message_id();
        message.id = Some(id.clone());
        message.version = Some(BAYEUX_VERSION.to_string());
        message.minimum_version = Some(BAYEUX_VERSION.to_string());
        let allowed = self.registry.allowed(BAYEUX_VERSION, &self.url);
        message.supported_connection_types = Some(
            allowed
                .iter()
                .map(|transport| transport.name().to_string())
                .collect(),
        );
        if let Some(callback) = snapshot.handshake_callback() {
            self.callbacks.insert(id, callback.clone());
        }

        if let Some(transport) = snapshot.transport() {
            debug!("handshaking on transport {}", transport.name());
        }
        self.state_send(ReplyKind::Handshake, vec![message]);
    }

    fn send_connect(self: &Arc<Self>) {
        let snapshot = self.machine.snapshot();
        let kind = snapshot.kind();
        if !matches!(
            kind,
            State::Connecting | State::Connected | State::Unconnected
        ) {
            return;
        }
        let Some(transport) = snapshot.transport() else {
            return;
        };

        let mut message = Message::new(META_CONNECT);
        message.id = Some(self.next_message_id());
        message.connection_type = Some(transport.name().to_string());
        if matches!(kind, State::Connecting | State::Unconnected) {
            // First connect after handshake or after a failure: ask the
            // server to reply immediately so the long-poll rhythm restarts.
            message.advice = Some(Advice::immediate());
        }
        debug!("connecting on transport {}", transport.name());
        self.state_send(ReplyKind::Connect, vec![message]);
    }

    fn send_disconnect(self: &Arc<Self>, callback: Option<MessageCallback>) {
        let mut message = Message::new(META_DISCONNECT);
        let id = self.next_message_id();
        message.id = Some(id.clone());
        if let Some(callback) = callback {
            self.callbacks.insert(id, callback);
        }
        self.state_send(ReplyKind::Disconnect, vec![message]);
    }

    /// Flush the queue if the session can currently send.
    fn send_batch(self: &Arc<Self>) {
        if !self.can_send() {
            return;
        }
        let messages = self.queue.take_all();
        if !messages.is_empty() {
            self.state_send(ReplyKind::Publish, messages);
        }
    }

    fn is_batching(&self) -> bool {
        self.batch_depth.load(Ordering::SeqCst) > 0
    }

    fn can_send(&self) -> bool {
        let handshaking = matches!(
            self.machine.current_kind(),
            State::Handshaking | State::Rehandshaking
        );
        !self.is_batching() && !handshaking
    }

    fn enqueue_send(self: &Arc<Self>, message: Message) {
        if self.can_send() {
            self.state_send(ReplyKind::Publish, vec![message]);
        } else {
            debug!(
                "enqueued message for {} (batching: {})",
                message.channel,
                self.is_batching()
            );
            self.queue.push(message);
        }
    }

    /// Stamp, extend, and hand a batch to the current transport.
    ///
    /// In `DISCONNECTED` and `TERMINATING` nothing is sent; the batch is
    /// failed instead.
    fn state_send(self: &Arc<Self>, kind: ReplyKind, mut messages: Vec<Message>) -> bool {
        let snapshot = self.machine.snapshot();
        if matches!(
            snapshot.kind(),
            State::Disconnected | State::Terminating
        ) {
            self.fail_messages(&TransportFailure::Closed, messages);
            return false;
        }
        let Some(transport) = snapshot.transport().cloned() else {
            return false;
        };

        let client_id = snapshot.client_id().map(str::to_string);
        let extensions: Vec<Arc<dyn Extension>> = self.extensions.read().clone();
        messages.retain_mut(|message| {
            // The handshake is the exchange that creates the session; it
            // must not carry a stale session id.
            if message.channel != META_HANDSHAKE {
                message.client_id = client_id.clone();
            }
            let id = message.id.clone();
            let keep = extensions.iter().all(|extension| extension.outgoing(message));
            // Extensions may rewrite any field except the id, which links
            // the reply back to this exchange.
            message.id = id;
            keep
        });
        if messages.is_empty() {
            return false;
        }

        debug!(
            "sending {} message(s) via {}",
            messages.len(),
            transport.name()
        );
        let listener: Arc<dyn TransportListener> = Arc::new(ReplyListener {
            client: Arc::downgrade(self),
            kind,
        });
        transport.send(listener, messages);
        true
    }

    fn process_handshake(self: &Arc<Self>, mut handshake: Message) {
        debug!("processing /meta/handshake reply");
        if handshake.is_successful() {
            let server = handshake
                .supported_connection_types
                .clone()
                .unwrap_or_default();
            let negotiated = self.registry.negotiate(&server, BAYEUX_VERSION, &self.url);
            if negotiated.is_empty() {
                let client_names = self.registry.known_names();
                let error = format!(
                    "405:c[{}],s[{}]:no transport",
                    client_names.join(", "),
                    server.join(", ")
                );
                warn!("handshake negotiation failed: {error}");
                handshake.successful = Some(false);
                handshake.error = Some(error);
                self.update_state(
                    |old| {
                        Some(SessionState::Terminating {
                            transport: old.transport()?.clone(),
                            abort: false,
                        })
                    },
                    |client| client.receive(handshake),
                );
                return;
            }

            let new_transport = negotiated[0].clone();
            let advice = handshake.advice.clone();
            let client_id = handshake.client_id.clone();
            self.update_state(
                |old| {
                    let old_transport = old.transport()?.clone();
                    if old_transport.name() != new_transport.name() {
                        self.prepare_transport(Some(&old_transport), &new_transport);
                    }
                    let action = advice
                        .as_ref()
                        .map(|advice| advice.reconnect_or(Reconnect::Retry))
                        .unwrap_or(Reconnect::Retry);
                    match action {
                        Reconnect::Retry => Some(SessionState::Connecting {
                            fields: old.handshake_fields().cloned(),
                            callback: old.handshake_callback().cloned(),
                            advice: advice.clone(),
                            transport: new_transport.clone(),
                            client_id: client_id.clone()?,
                        }),
                        Reconnect::None => Some(SessionState::Terminating {
                            transport: old_transport,
                            abort: false,
                        }),
                        Reconnect::Handshake => None,
                    }
                },
                |client| client.receive(handshake),
            );
        } else {
            let advice = handshake.advice.clone();
            self.update_state(
                |old| {
                    let action = advice
                        .as_ref()
                        .map(|advice| advice.reconnect_or(Reconnect::Handshake))
                        .unwrap_or(Reconnect::Handshake);
                    match action {
                        Reconnect::Handshake | Reconnect::Retry => {
                            Some(SessionState::Rehandshaking {
                                fields: old.handshake_fields().cloned(),
                                callback: old.handshake_callback().cloned(),
                                transport: old.transport()?.clone(),
                                backoff: self.next_backoff(old),
                            })
                        }
                        Reconnect::None => Some(SessionState::Terminating {
                            transport: old.transport()?.clone(),
                            abort: false,
                        }),
                    }
                },
                |client| client.receive(handshake),
            );
        }
    }

    fn process_connect(self: &Arc<Self>, connect: Message) {
        debug!("processing /meta/connect reply");
        let successful = connect.is_successful();
        let reply_advice = connect.advice.clone();
        self.update_state(
            |old| {
                // Fresh advice replaces the stored advice; otherwise the
                // previous advice keeps steering.
                let advice = reply_advice.or_else(|| old.advice().cloned());
                let action = advice
                    .as_ref()
                    .map(|advice| advice.reconnect_or(Reconnect::Retry))
                    .unwrap_or(Reconnect::Retry);
                if successful {
                    match action {
                        Reconnect::Retry => Some(SessionState::Connected {
                            fields: old.handshake_fields().cloned(),
                            callback: old.handshake_callback().cloned(),
                            advice,
                            transport: old.transport()?.clone(),
                            client_id: old.client_id()?.to_string(),
                        }),
                        // The server asked us to stop while a reply was
                        // still in flight; let the disconnect reply finish
                        // normally.
                        Reconnect::None => Some(SessionState::Disconnecting {
                            callback: None,
                            transport: old.transport()?.clone(),
                            client_id: old.client_id()?.to_string(),
                        }),
                        Reconnect::Handshake => None,
                    }
                } else {
                    match action {
                        Reconnect::Handshake => Some(SessionState::Rehandshaking {
                            fields: old.handshake_fields().cloned(),
                            callback: old.handshake_callback().cloned(),
                            transport: old.transport()?.clone(),
                            backoff: 0,
                        }),
                        Reconnect::Retry => Some(SessionState::Unconnected {
                            fields: old.handshake_fields().cloned(),
                            callback: old.handshake_callback().cloned(),
                            advice,
                            transport: old.transport()?.clone(),
                            client_id: old.client_id()?.to_string(),
                            backoff: self.next_backoff(old),
                            since: Instant::now(),
                        }),
                        Reconnect::None => Some(SessionState::Terminating {
                            transport: old.transport()?.clone(),
                            abort: false,
                        }),
                    }
                }
            },
            |client| client.receive(connect),
        );
    }

    fn process_disconnect(self: &Arc<Self>, disconnect: Message) {
        debug!("processing /meta/disconnect");
        self.update_state(
            |old| {
                Some(SessionState::Terminating {
                    transport: old.transport()?.clone(),
                    abort: false,
                })
            },
            |client| client.receive(disconnect),
        );
    }

    /// Transport-level failure of a handshake exchange: renegotiate the
    /// client-side transport list and retry, or terminate when no transport
    /// is left.
    fn handshake_failed(self: &Arc<Self>) {
        let allowed = self.registry.allowed(BAYEUX_VERSION, &self.url);
        if allowed.is_empty() {
            self.update_state(
                |old| {
                    Some(SessionState::Terminating {
                        transport: old.transport()?.clone(),
                        abort: false,
                    })
                },
                |_| {},
            );
            return;
        }
        let new_transport = allowed[0].clone();
        self.update_state(
            |old| {
                let old_transport = old.transport()?.clone();
                if old_transport.name() != new_transport.name() {
                    self.prepare_transport(Some(&old_transport), &new_transport);
                }
                Some(SessionState::Rehandshaking {
                    fields: old.handshake_fields().cloned(),
                    callback: old.handshake_callback().cloned(),
                    transport: new_transport.clone(),
                    backoff: self.next_backoff(old),
                })
            },
            |_| {},
        );
    }

    /// Transport-level failure of a connect exchange.
    fn connect_failed(self: &Arc<Self>) {
        self.update_state(
            |old| {
                // Keep the original failure time so the rehandshake
                // escalation measures the whole outage.
                let since = match old {
                    SessionState::Unconnected { since, .. } => *since,
                    _ => Instant::now(),
                };
                Some(SessionState::Unconnected {
                    fields: old.handshake_fields().cloned(),
                    callback: old.handshake_callback().cloned(),
                    advice: old.advice().cloned(),
                    transport: old.transport()?.clone(),
                    client_id: old.client_id()?.to_string(),
                    backoff: self.next_backoff(old),
                    since,
                })
            },
            |_| {},
        );
    }

    /// Transport-level failure of a disconnect exchange.
    fn disconnect_failed(self: &Arc<Self>) {
        self.update_state(
            |old| {
                Some(SessionState::Terminating {
                    transport: old.transport()?.clone(),
                    abort: false,
                })
            },
            |_| {},
        );
    }

    /// Surface a failed batch as synthetic unsuccessful replies.
    fn fail_messages(self: &Arc<Self>, failure: &TransportFailure, messages: Vec<Message>) {
        let connection_type = self
            .machine
            .snapshot()
            .transport()
            .map(|transport| transport.name().to_string());
        for message in messages {
            let mut failed = Message::new(message.channel.as_str());
            failed.id = message.id.clone();
            failed.successful = Some(false);
            failed.subscription = message.subscription.clone();
            failed.failure = Some(Failure {
                exception: Some(failure.to_string()),
                connection_type: connection_type.clone(),
                message: Some(Box::new(message)),
            });
            self.receive(failed);
        }
    }

    /// Route a received or synthesized message: extensions, then the
    /// one-shot callback correlated by id, then channel listeners.
    fn receive(self: &Arc<Self>, mut message: Message) {
        let extensions: Vec<Arc<dyn Extension>> = self.extensions.read().clone();
        for extension in &extensions {
            if !extension.incoming(&mut message) {
                debug!("message on {} dropped by extension", message.channel);
                return;
            }
        }

        if message.is_reply() {
            if let Some(id) = message.id.clone() {
                if let Some((_, action)) = self.remote_timeouts.remove(&id) {
                    action.cancel();
                }
                if let Some((_, callback)) = self.callbacks.remove(&id) {
                    invoke_callback(&callback, &message);
                }
            }
        }

        self.bus.notify(&message);
    }

    /// Terminal cleanup for `TERMINATING`.
    fn terminate(self: &Arc<Self>, transport: Arc<dyn Transport>, abort: bool) {
        info!("terminating session (abort: {abort})");
        if let Some(pending) = self.pending_action.lock().take() {
            pending.cancel();
        }
        if abort {
            transport.abort();
        } else {
            transport.terminate();
        }
        let queued = self.queue.take_all();
        if !queued.is_empty() {
            self.fail_messages(&TransportFailure::Closed, queued);
        }
        if self.owns_scheduler {
            self.scheduler.shutdown();
        }
        self.update_state(
            |old| {
                Some(SessionState::Disconnected {
                    transport: old.transport().cloned(),
                })
            },
            |_| {},
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let options = ClientOptions::default();
        let increment = options.backoff_increment.as_millis() as u64;
        let max = options.max_backoff.as_millis() as u64;

        let mut backoff = 0u64;
        let mut previous = 0u64;
        for _ in 0..40 {
            backoff = (backoff + increment).min(max);
            assert!(backoff >= previous);
            assert!(backoff <= max);
            previous = backoff;
        }
        assert_eq!(backoff, max);
    }

    #[test]
    fn test_message_ids_are_unique_and_monotonic() {
        let counter = AtomicU64::new(0);
        let mut last = 0u64;
        for _ in 0..100 {
            let id = counter.fetch_add(1, Ordering::Relaxed) + 1;
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.backoff_increment, Duration::from_millis(1000));
        assert_eq!(options.max_backoff, Duration::from_millis(30_000));
    }
}
