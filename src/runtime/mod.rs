//! Readiness-based server runtime.
//!
//! Built on mio (epoll on Linux, kqueue on macOS) and driven by a single
//! thread:
//! - `ListeningEndpoint`: the bound, listening socket
//! - `Poller`: readiness notification for the listener and all clients
//! - `ConnectionTable`: per-connection line buffers keyed by descriptor
//! - `Server`: the event loop tying them together

mod connection;
mod event_loop;
mod line_buffer;
mod listener;
mod poller;
mod sink;

pub use event_loop::{Server, ServerError};
pub use sink::LogSink;

use crate::config::Config;

/// Bind the configured port and serve until a fatal error.
pub fn run(config: Config) -> Result<(), ServerError> {
    let mut server = Server::bind(&config, LogSink)?;
    server.run()
}
