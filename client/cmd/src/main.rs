//! Bayeux client demo binary.
//!
//! Handshakes with a Bayeux server, subscribes to the requested channels,
//! prints deliveries, and publishes stdin lines until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use bayeux_session::{BayeuxClient, ClientOptions, Message, State, Transport};
use bayeux_transport::{LongPollingTransport, WebSocketTransport};

mod config;
mod logging;

use config::ClientConfig;

/// Bayeux protocol client
#[derive(Parser, Debug)]
#[command(name = "bayeux", version, about = "Bayeux publish/subscribe client")]
struct Args {
    /// Bayeux server URL, e.g. http://localhost:8080/cometd
    #[arg(long)]
    url: Option<String>,

    /// Channel to subscribe to (repeatable)
    #[arg(long)]
    subscribe: Vec<String>,

    /// Channel to publish stdin lines to
    #[arg(long)]
    publish: Option<String>,

    /// Transport preference order (repeatable): long-polling, websocket
    #[arg(long)]
    transport: Vec<String>,

    /// Time to wait for the handshake to complete, e.g. 10s
    #[arg(long, default_value = "10s")]
    handshake_timeout: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "bayeux.yaml")]
    config: PathBuf,
}

fn build_transports(names: &[String], url: &str) -> anyhow::Result<Vec<Arc<dyn Transport>>> {
    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    for name in names {
        match name.as_str() {
            "long-polling" => transports.push(Arc::new(LongPollingTransport::new(url)?)),
            "websocket" => transports.push(Arc::new(WebSocketTransport::new(url)?)),
            other => anyhow::bail!("unknown transport: {other}"),
        }
    }
    Ok(transports)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    let config = ClientConfig::load_from_file(&args.config)?;
    let url = args.url.unwrap_or(config.url);
    let transport_names = if args.transport.is_empty() {
        config.transports
    } else {
        args.transport
    };
    let mut channels = config.channels;
    channels.extend(args.subscribe);

    info!(
        "starting bayeux client v{} against {url} (transports: {transport_names:?})",
        env!("CARGO_PKG_VERSION")
    );

    let options = ClientOptions {
        backoff_increment: Duration::from_millis(config.backoff_increment_ms),
        max_backoff: Duration::from_millis(config.max_backoff_ms),
    };
    let transports = build_transports(&transport_names, &url)?;
    let client = BayeuxClient::with_options(url.as_str(), options, None, transports);

    client.handshake();
    if !client
        .wait_for(args.handshake_timeout.into(), &[State::Connected])
        .await
    {
        anyhow::bail!("handshake with {url} did not complete (state: {:?})", client.state());
    }
    info!(
        "connected as {}",
        client.client_id().unwrap_or_else(|| "?".to_string())
    );

    for channel in &channels {
        let name = channel.clone();
        client.subscribe(
            channel,
            Arc::new(move |message: &Message| {
                let data = message
                    .data
                    .as_ref()
                    .map(|data| data.to_string())
                    .unwrap_or_default();
                info!("[{name}] {data}");
            }),
        );
        info!("subscribed to {channel}");
    }

    // Publish stdin lines until EOF or Ctrl-C.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, disconnecting");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) if !line.trim().is_empty() => {
                        match &args.publish {
                            Some(channel) => {
                                client.publish(channel, serde_json::json!({"text": line}));
                            }
                            None => warn!("no --publish channel configured, line dropped"),
                        }
                    }
                    Some(_) => {}
                    None => {
                        info!("stdin closed, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    client.disconnect();
    if !client
        .wait_for(Duration::from_secs(5), &[State::Disconnected])
        .await
    {
        warn!("disconnect did not complete cleanly");
    }
    Ok(())
}
