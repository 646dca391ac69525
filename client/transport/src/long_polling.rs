//! HTTP long-polling transport.
//!
//! Batches are POSTed to the session URL as JSON arrays. The server holds
//! the `/meta/connect` request open until it has messages to deliver or its
//! advertised timeout elapses, so the request timeout here must comfortably
//! exceed the server's.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use bayeux_session::{Transport, TransportFailure, TransportListener};
use bayeux_wire::{message, Message};

use crate::error::TransportBuildError;

/// Wire name of this transport.
pub const NAME: &str = "long-polling";

/// Tuning options for [`LongPollingTransport`].
#[derive(Debug, Clone, Copy)]
pub struct LongPollingOptions {
    /// Upper bound for a single HTTP exchange, held long polls included.
    pub request_timeout: Duration,
}

impl Default for LongPollingOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// The HTTP long-polling transport.
///
/// A single `reqwest` client (and therefore a single in-memory cookie jar,
/// keyed by origin) is shared by every exchange of the session.
pub struct LongPollingTransport {
    url: Url,
    client: reqwest::Client,
    closed: Arc<AtomicBool>,
}

impl LongPollingTransport {
    /// Build a transport POSTing to `url` with default options.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is malformed or the HTTP client cannot
    /// be constructed.
    pub fn new(url: &str) -> Result<Self, TransportBuildError> {
        Self::with_options(url, LongPollingOptions::default())
    }

    /// Build a transport with explicit options.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is malformed or the HTTP client cannot
    /// be constructed.
    pub fn with_options(
        url: &str,
        options: LongPollingOptions,
    ) -> Result<Self, TransportBuildError> {
        let url = Url::parse(url)?;
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            url,
            client,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Transport for LongPollingTransport {
    fn name(&self) -> &str {
        NAME
    }

    fn accepts(&self, _version: &str, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    fn init(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        if self.closed.load(Ordering::SeqCst) {
            listener.on_failure(TransportFailure::Closed, messages);
            return;
        }

        let body = match message::encode_batch(&messages) {
            Ok(body) => body,
            Err(error) => {
                listener.on_failure(TransportFailure::Parse(error.to_string()), messages);
                return;
            }
        };
        listener.on_sending(&messages);

        let client = self.client.clone();
        let url = self.url.clone();
        let closed = self.closed.clone();
        let _task: JoinHandle<()> = tokio::spawn(async move {
            debug!("posting {} message(s) to {url}", messages.len());
            let result = client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await;

            if closed.load(Ordering::SeqCst) {
                listener.on_failure(TransportFailure::Closed, messages);
                return;
            }

            match result {
                Ok(response) if response.status().is_success() => {
                    match response.bytes().await {
                        Ok(bytes) => match message::parse_batch(&bytes) {
                            Ok(replies) => listener.on_messages(replies),
                            Err(error) => listener
                                .on_failure(TransportFailure::Parse(error.to_string()), messages),
                        },
                        Err(error) => {
                            listener.on_failure(TransportFailure::Io(error.to_string()), messages);
                        }
                    }
                }
                Ok(response) => {
                    listener.on_failure(
                        TransportFailure::HttpStatus(response.status().as_u16()),
                        messages,
                    );
                }
                Err(error) => {
                    listener.on_failure(TransportFailure::Io(error.to_string()), messages);
                }
            }
        });
    }

    fn terminate(&self) {
        // In-flight exchanges complete on their own tasks; their outcomes
        // are discarded by the closed flag.
        self.closed.store(true, Ordering::SeqCst);
    }
}
