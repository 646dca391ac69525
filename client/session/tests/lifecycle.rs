//! Session lifecycle tests driven by a scripted in-process transport.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use bayeux_session::{
    Advice, BayeuxClient, ClientOptions, Message, Reconnect, State, Transport, TransportFailure,
    TransportListener,
};

/// What the scripted server does with a sent batch.
enum Step {
    /// Deliver these replies immediately.
    Reply(Vec<Message>),
    /// Fail the exchange at the transport level.
    Fail(TransportFailure),
    /// Keep the exchange open (a held long poll); the test releases it.
    Hold,
    /// Swallow the batch.
    Ignore,
}

type Handler = Box<dyn FnMut(&[Message]) -> Step + Send>;

struct ScriptedTransport {
    handler: Mutex<Handler>,
    sent: Mutex<Vec<Message>>,
    held: Mutex<Vec<(Arc<dyn TransportListener>, Vec<Message>)>>,
    terminated: AtomicBool,
    aborted: AtomicBool,
}

impl ScriptedTransport {
    fn new(handler: impl FnMut(&[Message]) -> Step + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Box::new(handler)),
            sent: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        })
    }

    fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    fn sent_on(&self, channel: &str) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|message| message.channel == channel)
            .collect()
    }

    fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Take the held exchanges whose first message is on `channel`.
    fn take_held(&self, channel: &str) -> Vec<(Arc<dyn TransportListener>, Vec<Message>)> {
        let mut held = self.held.lock();
        let mut taken = Vec::new();
        held.retain_mut(|entry| {
            if entry.1.first().map(|m| m.channel.as_str()) == Some(channel) {
                taken.push((entry.0.clone(), std::mem::take(&mut entry.1)));
                false
            } else {
                true
            }
        });
        taken
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "long-polling"
    }

    fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>) {
        listener.on_sending(&messages);
        self.sent.lock().extend(messages.iter().cloned());
        let step = {
            let mut handler = self.handler.lock();
            (*handler)(&messages)
        };
        match step {
            Step::Reply(replies) => listener.on_messages(replies),
            Step::Fail(failure) => listener.on_failure(failure, messages),
            Step::Hold => self.held.lock().push((listener, messages)),
            Step::Ignore => {}
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.terminate();
    }
}

fn retry_advice() -> Advice {
    Advice {
        reconnect: Some(Reconnect::Retry),
        interval: Some(0),
        timeout: Some(30_000),
        ..Advice::default()
    }
}

fn handshake_reply(request: &Message) -> Message {
    let mut reply = Message::new("/meta/handshake");
    reply.id = request.id.clone();
    reply.successful = Some(true);
    reply.client_id = Some("c1".to_string());
    reply.supported_connection_types = Some(vec!["long-polling".to_string()]);
    reply.advice = Some(retry_advice());
    reply
}

fn simple_reply(request: &Message, successful: bool) -> Message {
    let mut reply = Message::new(&request.channel);
    reply.id = request.id.clone();
    reply.successful = Some(successful);
    reply
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_clean_lifecycle() {
    let mut connects = 0usize;
    let transport = ScriptedTransport::new(move |batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => Step::Reply(vec![handshake_reply(request)]),
            "/meta/connect" => {
                connects += 1;
                if connects == 1 {
                    Step::Reply(vec![simple_reply(request, true)])
                } else {
                    // The server holds subsequent long polls open.
                    Step::Hold
                }
            }
            "/meta/disconnect" => Step::Reply(vec![simple_reply(request, true)]),
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    assert_eq!(client.state(), State::Disconnected);

    client.handshake();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Connected])
            .await
    );
    assert_eq!(client.client_id().as_deref(), Some("c1"));

    client.disconnect();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Disconnected])
            .await
    );

    let sent = transport.sent();
    assert_eq!(sent[0].channel, "/meta/handshake");
    assert_eq!(sent[1].channel, "/meta/connect");
    assert_eq!(sent.last().unwrap().channel, "/meta/disconnect");

    // The first connect asks for an immediate reply.
    assert_eq!(sent[1].advice.as_ref().unwrap().timeout_ms(), 0);
    assert_eq!(sent[1].client_id.as_deref(), Some("c1"));
    // The handshake never carries a session id.
    assert!(sent[0].client_id.is_none());

    // Every outbound message has a unique id.
    let ids: Vec<String> = sent.iter().filter_map(|m| m.id.clone()).collect();
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());

    assert!(transport.terminated.load(Ordering::SeqCst));
    assert!(!transport.aborted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_handshake_advice_none_terminates_without_connect() {
    let transport = ScriptedTransport::new(|batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => {
                let mut reply = handshake_reply(request);
                reply.advice = Some(Advice {
                    reconnect: Some(Reconnect::None),
                    ..Advice::default()
                });
                Step::Reply(vec![reply])
            }
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    client.handshake();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Disconnected])
            .await
    );
    assert!(transport.sent_on("/meta/connect").is_empty());
}

#[tokio::test]
async fn test_server_requested_rehandshake() {
    let mut connects = 0usize;
    let transport = ScriptedTransport::new(move |batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => Step::Reply(vec![handshake_reply(request)]),
            "/meta/connect" => {
                connects += 1;
                match connects {
                    1 | 3 => Step::Reply(vec![simple_reply(request, true)]),
                    2 => {
                        // Invalidate the session from CONNECTED.
                        let mut reply = simple_reply(request, false);
                        reply.advice = Some(Advice {
                            reconnect: Some(Reconnect::Handshake),
                            ..Advice::default()
                        });
                        Step::Reply(vec![reply])
                    }
                    _ => Step::Hold,
                }
            }
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    client.handshake();

    // The second connect fails with reconnect=handshake, forcing a new
    // handshake and then a new connect rhythm.
    assert!(
        wait_until(Duration::from_secs(2), || {
            transport.sent_on("/meta/handshake").len() >= 2
        })
        .await
    );
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Connected])
            .await
    );
    assert!(transport.sent_on("/meta/connect").len() >= 3);
}

#[tokio::test]
async fn test_unconnected_escalates_to_handshake() {
    let transport = ScriptedTransport::new(|batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => {
                let mut reply = handshake_reply(request);
                reply.advice = Some(Advice {
                    reconnect: Some(Reconnect::Retry),
                    timeout: Some(100),
                    interval: Some(0),
                    max_interval: Some(500),
                    ..Advice::default()
                });
                Step::Reply(vec![reply])
            }
            // Every connect breaks at the transport level.
            "/meta/connect" => Step::Fail(TransportFailure::Io("connection refused".into())),
            _ => Step::Ignore,
        }
    });

    let options = ClientOptions {
        backoff_increment: Duration::from_millis(100),
        max_backoff: Duration::from_secs(30),
    };
    let client = BayeuxClient::with_options(
        "http://server/cometd",
        options,
        None,
        vec![transport.clone()],
    );
    client.handshake();

    // Connect retries back off until elapsed + backoff exceeds
    // timeout + interval + maxInterval, then a handshake is sent instead.
    assert!(
        wait_until(Duration::from_secs(5), || {
            transport.sent_on("/meta/handshake").len() >= 2
        })
        .await,
        "expected connect retries to escalate to a handshake"
    );
    assert!(!transport.sent_on("/meta/connect").is_empty());
}

#[tokio::test]
async fn test_negotiation_failure() {
    let transport = ScriptedTransport::new(|batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => {
                let mut reply = handshake_reply(request);
                // The server only offers a transport this client lacks.
                reply.supported_connection_types = Some(vec!["websocket".to_string()]);
                Step::Reply(vec![reply])
            }
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    let seen = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink = seen.clone();
    client.add_listener(
        "/meta/handshake",
        Arc::new(move |message: &Message| {
            sink.lock().push(message.clone());
        }),
    );

    client.handshake();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Disconnected])
            .await
    );

    let replies = seen.lock();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].successful, Some(false));
    assert_eq!(
        replies[0].error.as_deref(),
        Some("405:c[long-polling],s[websocket]:no transport")
    );
    assert!(transport.sent_on("/meta/connect").is_empty());
}

#[tokio::test]
async fn test_subscribe_dedup_and_glob_dispatch() {
    let mut connects = 0usize;
    let transport = ScriptedTransport::new(move |batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => Step::Reply(vec![handshake_reply(request)]),
            "/meta/connect" => {
                connects += 1;
                if connects == 1 {
                    Step::Reply(vec![simple_reply(request, true)])
                } else {
                    Step::Hold
                }
            }
            "/meta/subscribe" => Step::Reply(vec![{
                let mut reply = simple_reply(request, true);
                reply.subscription = request.subscription.clone();
                reply
            }]),
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    client.handshake();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Connected])
            .await
    );

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let counter = first.clone();
    let other = second.clone();
    client.batch(|| {
        client.subscribe(
            "/foo",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        client.subscribe(
            "/foo",
            Arc::new(move |_| {
                other.fetch_add(1, Ordering::SeqCst);
            }),
        );
    });

    // Two local subscribers, exactly one wire subscription.
    assert!(
        wait_until(Duration::from_secs(2), || {
            !transport.sent_on("/meta/subscribe").is_empty()
        })
        .await
    );
    let subscribes = transport.sent_on("/meta/subscribe");
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0].subscription.as_deref(), Some("/foo"));

    // The server delivers a /foo message on the held long poll.
    assert!(wait_until(Duration::from_secs(2), || transport.held_count() > 0).await);
    for (listener, messages) in transport.take_held("/meta/connect") {
        let mut delivery = Message::new("/foo");
        delivery.data = Some(json!({"text": "hello"}));
        listener.on_messages(vec![simple_reply(&messages[0], true), delivery]);
    }

    assert!(
        wait_until(Duration::from_secs(2), || {
            first.load(Ordering::SeqCst) == 1 && second.load(Ordering::SeqCst) == 1
        })
        .await
    );
}

#[tokio::test]
async fn test_late_connect_reply_cannot_leave_disconnecting() {
    let mut connects = 0usize;
    let transport = ScriptedTransport::new(move |batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => Step::Reply(vec![handshake_reply(request)]),
            "/meta/connect" => {
                connects += 1;
                if connects == 1 {
                    Step::Reply(vec![simple_reply(request, true)])
                } else {
                    Step::Hold
                }
            }
            "/meta/disconnect" => Step::Hold,
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    client.handshake();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Connected])
            .await
    );
    assert!(wait_until(Duration::from_secs(2), || transport.held_count() > 0).await);

    client.disconnect();
    assert!(wait_until(Duration::from_secs(2), || {
        client.state() == State::Disconnecting
    })
    .await);

    // The long poll completes late with reconnect=retry; the legality
    // graph must keep the session in DISCONNECTING.
    for (listener, messages) in transport.take_held("/meta/connect") {
        let mut reply = simple_reply(&messages[0], true);
        reply.advice = Some(retry_advice());
        listener.on_messages(vec![reply]);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), State::Disconnecting);

    // Releasing the disconnect reply finishes the lifecycle.
    for (listener, messages) in transport.take_held("/meta/disconnect") {
        listener.on_messages(vec![simple_reply(&messages[0], true)]);
    }
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Disconnected])
            .await
    );
}

#[tokio::test]
async fn test_publish_queued_during_handshake_flushes_after() {
    let transport = ScriptedTransport::new(|batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => Step::Hold,
            "/meta/connect" => Step::Hold,
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    client.handshake();
    assert!(wait_until(Duration::from_secs(2), || transport.held_count() > 0).await);

    // Published while the handshake is in flight: held in the queue.
    client.publish("/chat", json!({"text": "early"}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.sent_on("/chat").is_empty());

    for (listener, messages) in transport.take_held("/meta/handshake") {
        listener.on_messages(vec![handshake_reply(&messages[0])]);
    }

    assert!(
        wait_until(Duration::from_secs(2), || {
            !transport.sent_on("/chat").is_empty()
        })
        .await
    );
    let published = transport.sent_on("/chat");
    assert_eq!(published[0].client_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_remote_call_timeout() {
    let mut connects = 0usize;
    let transport = ScriptedTransport::new(move |batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => Step::Reply(vec![handshake_reply(request)]),
            "/meta/connect" => {
                connects += 1;
                if connects == 1 {
                    Step::Reply(vec![simple_reply(request, true)])
                } else {
                    Step::Hold
                }
            }
            // The service request is swallowed; the reply never comes.
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    client.handshake();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Connected])
            .await
    );

    let replies = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink = replies.clone();
    client.remote_call(
        "echo",
        json!({"ping": 1}),
        Duration::from_millis(100),
        Arc::new(move |message: &Message| {
            sink.lock().push(message.clone());
        }),
    );

    assert!(
        wait_until(Duration::from_secs(2), || !replies.lock().is_empty()).await
    );
    let replies = replies.lock();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].channel, "/service/echo");
    assert_eq!(replies[0].successful, Some(false));
    assert_eq!(replies[0].error.as_deref(), Some("406::timeout"));

    assert_eq!(transport.sent_on("/service/echo").len(), 1);
}

#[tokio::test]
async fn test_abort_skips_disconnect_exchange() {
    let mut connects = 0usize;
    let transport = ScriptedTransport::new(move |batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => Step::Reply(vec![handshake_reply(request)]),
            "/meta/connect" => {
                connects += 1;
                if connects == 1 {
                    Step::Reply(vec![simple_reply(request, true)])
                } else {
                    Step::Hold
                }
            }
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    client.handshake();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Connected])
            .await
    );

    client.abort();
    assert!(
        client
            .wait_for(Duration::from_secs(2), &[State::Disconnected])
            .await
    );
    assert!(transport.aborted.load(Ordering::SeqCst));
    assert!(transport.sent_on("/meta/disconnect").is_empty());
}

#[tokio::test]
async fn test_transport_failure_surfaces_synthetic_reply() {
    let transport = ScriptedTransport::new(|batch| {
        let request = &batch[0];
        match request.channel.as_str() {
            "/meta/handshake" => Step::Fail(TransportFailure::Io("connection refused".into())),
            _ => Step::Ignore,
        }
    });

    let client = BayeuxClient::new("http://server/cometd", vec![transport.clone()]);
    let seen = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink = seen.clone();
    client.add_listener(
        "/meta/handshake",
        Arc::new(move |message: &Message| {
            sink.lock().push(message.clone());
        }),
    );

    client.handshake();
    assert!(
        wait_until(Duration::from_secs(2), || !seen.lock().is_empty()).await
    );

    let replies = seen.lock();
    assert_eq!(replies[0].successful, Some(false));
    let failure = replies[0].failure.as_ref().unwrap();
    assert_eq!(failure.connection_type.as_deref(), Some("long-polling"));
    assert!(failure.exception.as_deref().unwrap().contains("connection refused"));
    // The failed request travels with the synthetic reply.
    assert_eq!(
        failure.message.as_ref().unwrap().channel,
        "/meta/handshake"
    );
}
