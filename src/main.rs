//! line-sink: a receive-only TCP line server
//!
//! Accepts any number of clients on one port, splits each client's byte
//! stream on `\n` and logs every complete message with the connection it
//! came from. Nothing is ever sent back.
//!
//! Features:
//! - Single-threaded readiness loop (epoll/kqueue via mio)
//! - Partial lines buffered per connection across reads
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use tracing::{error, info};
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

    info!(
        port = config.port,
        batch_size = config.batch_size,
        "Starting line-sink server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server stopped");
        return Err(e.into());
    }
    Ok(())
}
