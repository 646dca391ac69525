//! Session lifecycle states and the atomic state machine.
//!
//! The session state is a tagged union: each phase carries exactly the
//! context it needs (negotiated transport, session id, latest advice,
//! current backoff, preserved handshake template). Transitions are proposed
//! as whole new states and applied only when the fixed legality graph
//! allows them.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use bayeux_wire::Advice;

use crate::client::MessageCallback;
use crate::transport::Transport;

/// The lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Before the first handshake, and after termination completes.
    Disconnected,
    /// A requested handshake is being sent.
    Handshaking,
    /// A failed or server-invalidated handshake is being retried.
    Rehandshaking,
    /// The first connect after a successful handshake is being sent.
    Connecting,
    /// The session is established and long-polling.
    Connected,
    /// The connection broke after the handshake; connects are retried.
    Unconnected,
    /// A disconnect request is being sent.
    Disconnecting,
    /// Terminal cleanup is running.
    Terminating,
}

impl State {
    /// Whether observing `self` satisfies a waiter asking for `target`.
    ///
    /// Transient states can be missed between wakeups; a state implies the
    /// transient states it can only have been reached through.
    pub fn implies(self, target: State) -> bool {
        if self == target {
            return true;
        }
        matches!(
            (self, target),
            (State::Connecting, State::Handshaking)
                | (State::Connected, State::Handshaking)
                | (State::Connected, State::Connecting)
                | (State::Terminating, State::Disconnecting)
                | (State::Disconnected, State::Disconnecting)
                | (State::Disconnected, State::Terminating)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Disconnected => "DISCONNECTED",
            State::Handshaking => "HANDSHAKING",
            State::Rehandshaking => "REHANDSHAKING",
            State::Connecting => "CONNECTING",
            State::Connected => "CONNECTED",
            State::Unconnected => "UNCONNECTED",
            State::Disconnecting => "DISCONNECTING",
            State::Terminating => "TERMINATING",
        };
        f.write_str(name)
    }
}

/// Handshake template fields supplied by the application.
pub type HandshakeFields = Map<String, Value>;

/// A session state with its per-phase context.
#[derive(Clone)]
pub(crate) enum SessionState {
    Disconnected {
        transport: Option<Arc<dyn Transport>>,
    },
    Handshaking {
        fields: Option<HandshakeFields>,
        callback: Option<MessageCallback>,
        transport: Arc<dyn Transport>,
    },
    Rehandshaking {
        fields: Option<HandshakeFields>,
        callback: Option<MessageCallback>,
        transport: Arc<dyn Transport>,
        backoff: u64,
    },
    Connecting {
        fields: Option<HandshakeFields>,
        callback: Option<MessageCallback>,
        advice: Option<Advice>,
        transport: Arc<dyn Transport>,
        client_id: String,
    },
    Connected {
        fields: Option<HandshakeFields>,
        callback: Option<MessageCallback>,
        advice: Option<Advice>,
        transport: Arc<dyn Transport>,
        client_id: String,
    },
    Unconnected {
        fields: Option<HandshakeFields>,
        callback: Option<MessageCallback>,
        advice: Option<Advice>,
        transport: Arc<dyn Transport>,
        client_id: String,
        backoff: u64,
        since: Instant,
    },
    Disconnecting {
        callback: Option<MessageCallback>,
        transport: Arc<dyn Transport>,
        client_id: String,
    },
    Terminating {
        transport: Arc<dyn Transport>,
        abort: bool,
    },
}

impl SessionState {
    pub(crate) fn kind(&self) -> State {
        match self {
            SessionState::Disconnected { .. } => State::Disconnected,
            SessionState::Handshaking { .. } => State::Handshaking,
            SessionState::Rehandshaking { .. } => State::Rehandshaking,
            SessionState::Connecting { .. } => State::Connecting,
            SessionState::Connected { .. } => State::Connected,
            SessionState::Unconnected { .. } => State::Unconnected,
            SessionState::Disconnecting { .. } => State::Disconnecting,
            SessionState::Terminating { .. } => State::Terminating,
        }
    }

    pub(crate) fn transport(&self) -> Option<&Arc<dyn Transport>> {
        match self {
            SessionState::Disconnected { transport } => transport.as_ref(),
            SessionState::Handshaking { transport, .. }
            | SessionState::Rehandshaking { transport, .. }
            | SessionState::Connecting { transport, .. }
            | SessionState::Connected { transport, .. }
            | SessionState::Unconnected { transport, .. }
            | SessionState::Disconnecting { transport, .. }
            | SessionState::Terminating { transport, .. } => Some(transport),
        }
    }

    /// The server-assigned session id, present exactly while handshook.
    pub(crate) fn client_id(&self) -> Option<&str> {
        match self {
            SessionState::Connecting { client_id, .. }
            | SessionState::Connected { client_id, .. }
            | SessionState::Unconnected { client_id, .. }
            | SessionState::Disconnecting { client_id, .. } => Some(client_id),
            _ => None,
        }
    }

    pub(crate) fn advice(&self) -> Option<&Advice> {
        match self {
            SessionState::Connecting { advice, .. }
            | SessionState::Connected { advice, .. }
            | SessionState::Unconnected { advice, .. } => advice.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn backoff(&self) -> u64 {
        match self {
            SessionState::Rehandshaking { backoff, .. }
            | SessionState::Unconnected { backoff, .. } => *backoff,
            _ => 0,
        }
    }

    pub(crate) fn handshake_fields(&self) -> Option<&HandshakeFields> {
        match self {
            SessionState::Handshaking { fields, .. }
            | SessionState::Rehandshaking { fields, .. }
            | SessionState::Connecting { fields, .. }
            | SessionState::Connected { fields, .. }
            | SessionState::Unconnected { fields, .. } => fields.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn handshake_callback(&self) -> Option<&MessageCallback> {
        match self {
            SessionState::Handshaking { callback, .. }
            | SessionState::Rehandshaking { callback, .. }
            | SessionState::Connecting { callback, .. }
            | SessionState::Connected { callback, .. }
            | SessionState::Unconnected { callback, .. } => callback.as_ref(),
            _ => None,
        }
    }

    /// Whether the legality graph allows moving to `new`.
    pub(crate) fn can_transition_to(&self, new: &SessionState) -> bool {
        let allowed: &[State] = match self.kind() {
            State::Disconnected => &[State::Handshaking],
            State::Handshaking | State::Rehandshaking => {
                &[State::Connecting, State::Rehandshaking, State::Terminating]
            }
            State::Connecting | State::Connected => &[
                State::Connected,
                State::Unconnected,
                State::Rehandshaking,
                State::Disconnecting,
                State::Terminating,
            ],
            State::Unconnected => &[
                State::Connected,
                State::Unconnected,
                State::Rehandshaking,
                State::Terminating,
            ],
            State::Disconnecting => &[State::Terminating],
            State::Terminating => &[State::Disconnected],
        };
        allowed.contains(&new.kind())
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())?;
        if let Some(client_id) = self.client_id() {
            write!(f, "[{client_id}]")?;
        }
        Ok(())
    }
}

/// A successfully applied transition.
pub(crate) struct Applied {
    pub(crate) old: State,
    pub(crate) snapshot: SessionState,
}

/// Atomic holder of the session state.
///
/// The cell is guarded by a mutex held only for the validate-and-swap; the
/// updaters-in-flight counter lets waiters distinguish a settled state from
/// one whose side effects are still being delivered.
pub(crate) struct StateMachine {
    state: Mutex<SessionState>,
    updaters: AtomicUsize,
    settled: watch::Sender<u64>,
}

impl StateMachine {
    pub(crate) fn new(initial: SessionState) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            state: Mutex::new(initial),
            updaters: AtomicUsize::new(0),
            settled,
        }
    }

    /// Mark the start of an update. Must be paired with [`StateMachine::end`].
    pub(crate) fn begin(&self) {
        self.updaters.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark the end of an update and wake waiters once no update is in
    /// flight.
    pub(crate) fn end(&self) {
        if self.updaters.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.settled.send_modify(|generation| *generation += 1);
        }
    }

    /// Validate and apply a proposed transition.
    ///
    /// `propose` may return `None` to leave the state unchanged. An illegal
    /// proposal is rejected and logged; the caller's side effects still run
    /// exactly once either way.
    pub(crate) fn try_apply<F>(&self, propose: F) -> Option<Applied>
    where
        F: FnOnce(&SessionState) -> Option<SessionState>,
    {
        let mut state = self.state.lock();
        let new = propose(&*state)?;
        if !state.can_transition_to(&new) {
            debug!("state not updateable: {:?} -> {:?}", *state, new);
            return None;
        }
        let old = state.kind();
        debug!("state update: {:?} -> {:?}", *state, new);
        *state = new.clone();
        Some(Applied {
            old,
            snapshot: new,
        })
    }

    pub(crate) fn current_kind(&self) -> State {
        self.state.lock().kind()
    }

    pub(crate) fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    fn is_settled(&self) -> bool {
        self.updaters.load(Ordering::SeqCst) == 0
    }

    fn satisfied(&self, targets: &[State]) -> bool {
        if !self.is_settled() {
            return false;
        }
        let current = self.current_kind();
        targets.iter().any(|target| current.implies(*target))
    }

    /// Wait until the settled state implies one of `targets`.
    ///
    /// Returns false when `timeout` elapses first.
    pub(crate) async fn wait_for(&self, timeout: Duration, targets: &[State]) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut settled = self.settled.subscribe();
        loop {
            if self.satisfied(targets) {
                return true;
            }
            match tokio::time::timeout_at(deadline, settled.changed()).await {
                Ok(Ok(())) => continue,
                // The machine is gone or the deadline passed; one last look.
                Ok(Err(_)) | Err(_) => return self.satisfied(targets),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected() -> SessionState {
        SessionState::Disconnected { transport: None }
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn name(&self) -> &str {
            "null"
        }

        fn send(
            &self,
            _listener: Arc<dyn crate::transport::TransportListener>,
            _messages: Vec<bayeux_wire::Message>,
        ) {
        }
    }

    fn transport() -> Arc<dyn Transport> {
        Arc::new(NullTransport)
    }

    fn handshaking() -> SessionState {
        SessionState::Handshaking {
            fields: None,
            callback: None,
            transport: transport(),
        }
    }

    fn connected() -> SessionState {
        SessionState::Connected {
            fields: None,
            callback: None,
            advice: None,
            transport: transport(),
            client_id: "c1".into(),
        }
    }

    fn terminating() -> SessionState {
        SessionState::Terminating {
            transport: transport(),
            abort: false,
        }
    }

    #[test]
    fn test_disconnected_only_reaches_handshaking() {
        let state = disconnected();
        assert!(state.can_transition_to(&handshaking()));
        assert!(!state.can_transition_to(&connected()));
        assert!(!state.can_transition_to(&terminating()));
        assert!(!state.can_transition_to(&disconnected()));
    }

    #[test]
    fn test_disconnecting_rejects_connected() {
        let state = SessionState::Disconnecting {
            callback: None,
            transport: transport(),
            client_id: "c1".into(),
        };
        assert!(!state.can_transition_to(&connected()));
        assert!(state.can_transition_to(&terminating()));
    }

    #[test]
    fn test_client_id_presence_by_phase() {
        assert!(disconnected().client_id().is_none());
        assert!(handshaking().client_id().is_none());
        assert!(terminating().client_id().is_none());
        assert_eq!(connected().client_id(), Some("c1"));
        let unconnected = SessionState::Unconnected {
            fields: None,
            callback: None,
            advice: None,
            transport: transport(),
            client_id: "c1".into(),
            backoff: 1000,
            since: Instant::now(),
        };
        assert_eq!(unconnected.client_id(), Some("c1"));
        assert_eq!(unconnected.backoff(), 1000);
    }

    #[test]
    fn test_implies() {
        assert!(State::Connected.implies(State::Connected));
        assert!(State::Connected.implies(State::Connecting));
        assert!(State::Connected.implies(State::Handshaking));
        assert!(State::Connecting.implies(State::Handshaking));
        assert!(State::Terminating.implies(State::Disconnecting));
        assert!(State::Disconnected.implies(State::Terminating));
        assert!(!State::Handshaking.implies(State::Connected));
        assert!(!State::Unconnected.implies(State::Connected));
    }

    #[test]
    fn test_rejected_proposal_leaves_state() {
        let machine = StateMachine::new(disconnected());
        let applied = machine.try_apply(|_| Some(connected()));
        assert!(applied.is_none());
        assert_eq!(machine.current_kind(), State::Disconnected);
    }

    #[test]
    fn test_applied_proposal_swaps_state() {
        let machine = StateMachine::new(disconnected());
        let applied = machine.try_apply(|_| Some(handshaking())).unwrap();
        assert_eq!(applied.old, State::Disconnected);
        assert_eq!(applied.snapshot.kind(), State::Handshaking);
        assert_eq!(machine.current_kind(), State::Handshaking);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let machine = StateMachine::new(disconnected());
        assert!(
            !machine
                .wait_for(Duration::from_millis(30), &[State::Connected])
                .await
        );
        // DISCONNECTED implies the terminal phases it is reached through.
        assert!(
            machine
                .wait_for(Duration::from_millis(30), &[State::Terminating])
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_ignores_unsettled_state() {
        let machine = Arc::new(StateMachine::new(disconnected()));

        machine.begin();
        machine.try_apply(|_| Some(handshaking()));

        // The update has not ended yet, so the waiter must not observe it.
        assert!(
            !machine
                .wait_for(Duration::from_millis(30), &[State::Handshaking])
                .await
        );

        machine.end();
        assert!(
            machine
                .wait_for(Duration::from_millis(30), &[State::Handshaking])
                .await
        );
    }
}
