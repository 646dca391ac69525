//! WebSocket transport.
//!
//! A single full-duplex connection carries every exchange of the session.
//! The connection is established lazily on the first send; a read task
//! correlates replies to their exchange by message id and routes anything
//! else (server pushes, server-initiated disconnects) to the engine's
//! message listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use bayeux_session::{Transport, TransportFailure, TransportListener};
use bayeux_wire::{message, Message};

use crate::error::TransportBuildError;

/// Wire name of this transport.
pub const NAME: &str = "websocket";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsFrame>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A pending exchange: the listener waiting for the reply and the request
/// that produced it.
struct PendingExchange {
    listener: Arc<dyn TransportListener>,
    request: Message,
}

/// The WebSocket transport.
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    url: Url,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    pending: DashMap<String, PendingExchange>,
    message_listener: Mutex<Option<Arc<dyn TransportListener>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebSocketTransport {
    /// Build a transport for `url`. `http`/`https` URLs are rewritten to
    /// `ws`/`wss`.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is malformed.
    pub fn new(url: &str) -> Result<Self, TransportBuildError> {
        let mut url = Url::parse(url)?;
        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            // set_scheme only rejects invalid transitions; ws/wss from
            // http/https is always accepted.
            let _ = url.set_scheme(scheme);
        }
        Ok(Self {
            inner: Arc::new(WsInner {
                url,
                sink: tokio::sync::Mutex::new(None),
                pending: DashMap::new(),
                message_listener: Mutex::new(None),
                read_task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        NAME
    }

    fn accepts(&self, _version: &str, url: &str) -> bool {
        ["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
    }

    fn init(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            listener.on_failure(TransportFailure::Closed, messages);
            return;
        }
        listener.on_sending(&messages);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.write_batch(listener, messages).await;
        });
    }

    fn terminate(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.read_task.lock().take() {
            task.abort();
        }
        self.inner.fail_pending(TransportFailure::Closed);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Some(mut sink) = inner.sink.lock().await.take() {
                let _ = sink.close().await;
            }
        });
    }

    fn set_message_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.inner.message_listener.lock() = Some(listener);
    }
}

impl WsInner {
    /// Connect if needed and write the batch as one text frame.
    async fn write_batch(self: Arc<Self>, listener: Arc<dyn TransportListener>, messages: Vec<Message>) {
        let text = match message::encode_batch(&messages) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(error) => {
                    listener.on_failure(TransportFailure::Parse(error.to_string()), messages);
                    return;
                }
            },
            Err(error) => {
                listener.on_failure(TransportFailure::Parse(error.to_string()), messages);
                return;
            }
        };

        let mut sink = self.sink.lock().await;
        if sink.is_none() {
            debug!("connecting to {}", self.url);
            match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => {
                    let (write, read) = stream.split();
                    *sink = Some(write);
                    let inner = self.clone();
                    *self.read_task.lock() =
                        Some(tokio::spawn(async move { inner.read_loop(read).await }));
                }
                Err(error) => {
                    listener.on_failure(TransportFailure::Io(error.to_string()), messages);
                    return;
                }
            }
        }

        // Register the exchanges before writing so replies racing the
        // write cannot be misrouted.
        for request in &messages {
            if let Some(id) = &request.id {
                self.pending.insert(
                    id.clone(),
                    PendingExchange {
                        listener: listener.clone(),
                        request: request.clone(),
                    },
                );
            }
        }

        let outcome = sink
            .as_mut()
            .expect("sink was just installed")
            .send(WsFrame::Text(text))
            .await;
        if let Err(error) = outcome {
            for request in &messages {
                if let Some(id) = &request.id {
                    self.pending.remove(id);
                }
            }
            *sink = None;
            listener.on_failure(TransportFailure::Io(error.to_string()), messages);
        }
    }

    /// Read frames until the connection drops, routing each reply to its
    /// exchange and everything else to the message listener.
    async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsFrame::Text(text)) => self.route_frame(text.as_bytes()),
                Ok(WsFrame::Binary(bytes)) => self.route_frame(&bytes),
                Ok(WsFrame::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    warn!("websocket read failed: {error}");
                    break;
                }
            }
        }
        debug!("websocket read loop ended");
        self.sink.lock().await.take();
        self.fail_pending(TransportFailure::Io("connection closed".to_string()));
    }

    fn route_frame(&self, payload: &[u8]) {
        let replies = match message::parse_batch(payload) {
            Ok(replies) => replies,
            Err(error) => {
                warn!("dropping malformed websocket frame: {error}");
                return;
            }
        };
        for reply in replies {
            let exchange = reply
                .id
                .as_ref()
                .filter(|_| reply.is_reply())
                .and_then(|id| self.pending.remove(id))
                .map(|(_, exchange)| exchange);
            match exchange {
                Some(exchange) => exchange.listener.on_messages(vec![reply]),
                None => {
                    let listener = self.message_listener.lock().clone();
                    match listener {
                        Some(listener) => listener.on_messages(vec![reply]),
                        None => debug!("dropping unsolicited message on {}", reply.channel),
                    }
                }
            }
        }
    }

    fn fail_pending(&self, failure: TransportFailure) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, exchange)) = self.pending.remove(&id) {
                exchange
                    .listener
                    .on_failure(failure.clone(), vec![exchange.request]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ws_and_http_urls() {
        let transport = WebSocketTransport::new("ws://server/cometd").unwrap();
        assert!(transport.accepts("1.0", "ws://server/cometd"));
        assert!(transport.accepts("1.0", "wss://server/cometd"));
        assert!(transport.accepts("1.0", "http://server/cometd"));
        assert!(!transport.accepts("1.0", "ftp://server/cometd"));
    }

    #[test]
    fn test_http_url_is_rewritten_to_ws() {
        let transport = WebSocketTransport::new("https://server/cometd").unwrap();
        assert_eq!(transport.inner.url.scheme(), "wss");

        let transport = WebSocketTransport::new("http://server/cometd").unwrap();
        assert_eq!(transport.inner.url.scheme(), "ws");

        let transport = WebSocketTransport::new("ws://server/cometd").unwrap();
        assert_eq!(transport.inner.url.scheme(), "ws");
    }

    #[tokio::test]
    async fn test_terminated_transport_fails_batches() {
        struct RecordingListener {
            failures: parking_lot::Mutex<Vec<TransportFailure>>,
        }

        impl TransportListener for RecordingListener {
            fn on_messages(&self, _messages: Vec<Message>) {}

            fn on_failure(&self, failure: TransportFailure, _messages: Vec<Message>) {
                self.failures.lock().push(failure);
            }
        }

        let transport = WebSocketTransport::new("ws://server/cometd").unwrap();
        transport.terminate();

        let listener = Arc::new(RecordingListener {
            failures: parking_lot::Mutex::new(Vec::new()),
        });
        transport.send(listener.clone(), vec![Message::new("/meta/handshake")]);
        assert!(matches!(
            listener.failures.lock()[0],
            TransportFailure::Closed
        ));
    }
}
