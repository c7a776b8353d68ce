//! Destination for messages produced by the event loop.

use crate::runtime::connection::{ConnectionId, DisconnectReason};
use std::net::SocketAddr;
use tracing::info;

/// Receives completed messages, tagged with the connection they came from.
///
/// Called from the event loop thread only. Implementations never see a
/// partial line.
pub trait MessageSink {
    /// A complete message, without its trailing delimiter.
    fn on_message(&mut self, id: ConnectionId, message: &[u8]);

    fn on_connect(&mut self, _id: ConnectionId, _peer: SocketAddr) {}

    fn on_disconnect(&mut self, _id: ConnectionId, _reason: &DisconnectReason) {}
}

/// Logs every message at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn on_message(&mut self, id: ConnectionId, message: &[u8]) {
        info!(
            conn_id = id,
            message = %String::from_utf8_lossy(message),
            "Received message"
        );
    }
}
