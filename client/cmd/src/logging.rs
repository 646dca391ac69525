//! Tracing setup for the bayeux binary.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// The given level applies to the client crates; everything else stays at
/// `info`. `RUST_LOG` is not consulted so the CLI flag is authoritative.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::new("info")
        .add_directive(format!("bayeux={level}").parse()?)
        .add_directive(format!("bayeux_session={level}").parse()?)
        .add_directive(format!("bayeux_transport={level}").parse()?)
        .add_directive(format!("bayeux_wire={level}").parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}
