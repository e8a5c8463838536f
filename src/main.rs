//! chunkcast: a fixed-payload connection server
//!
//! Every client gets a `session-id` handshake line, then each read from the
//! client is answered with the same payload: the content file plus a CRLF
//! marker, sent in fixed-size chunks that survive partial writes.
//!
//! Two concurrency styles:
//! - callback: io_uring completions drive the session (Linux only)
//! - readiness: mio readiness waits drive the session (epoll/kqueue)
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod content;
mod error;
mod runtime;

use config::{Config, DEFAULT_PORT};
use content::ContentStore;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(fallback) = &config.port_fallback {
        warn!("{}", fallback);
        info!(port = DEFAULT_PORT, "Using default port");
    }

    info!(
        host = %config.host,
        port = config.port,
        style = ?config.style,
        mode = ?config.mode,
        content = %config.content_path.display(),
        chunk_size = config.chunk_size,
        "Starting chunkcast server"
    );

    // The payload must be readable before any client is accepted.
    let store = ContentStore::new(&config.content_path, config.chunk_size)?;
    store.load()?;

    runtime::run(config, Arc::new(store))?;
    Ok(())
}
