//! Single-threaded event loop.
//!
//! One poller watches the listening socket plus every accepted client.
//! Each wait returns a batch of ready tokens which is dispatched to
//! completion before the next wait:
//! - the listener token accepts every pending connection;
//! - a client token drains the socket through its line buffer.
//!
//! Registration and the connection table change together, so a torn-down
//! descriptor never receives another dispatch.

use crate::config::Config;
use crate::runtime::connection::{
    Connection, ConnectionId, ConnectionTable, DisconnectReason, DrainOutcome, READ_CHUNK_SIZE,
};
use crate::runtime::listener::{ListenError, ListeningEndpoint};
use crate::runtime::poller::Poller;
use crate::runtime::sink::MessageSink;
use mio::Token;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Errors that stop the server.
#[derive(Debug)]
pub enum ServerError {
    /// Listening socket could not be set up.
    Listen(ListenError),
    /// Poller creation or listener registration failed.
    Multiplexer(io::Error),
    /// Waiting for readiness failed; no further connections are served.
    Wait(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Listen(e) => write!(f, "listening socket setup failed: {e}"),
            ServerError::Multiplexer(e) => write!(f, "poller setup failed: {e}"),
            ServerError::Wait(e) => write!(f, "waiting for events failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Listen(e) => Some(e),
            ServerError::Multiplexer(e) | ServerError::Wait(e) => Some(e),
        }
    }
}

impl From<ListenError> for ServerError {
    fn from(e: ListenError) -> Self {
        ServerError::Listen(e)
    }
}

fn token_of(id: ConnectionId) -> Token {
    Token(id as usize)
}

/// Accept errors that concern one queued connection only; the ones behind
/// it can still be accepted.
fn peer_gave_up(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

/// Receive-only line server.
pub struct Server<S> {
    endpoint: ListeningEndpoint,
    poller: Poller,
    connections: ConnectionTable,
    sink: S,
    ready: Vec<Token>,
    scratch: Box<[u8]>,
}

impl<S: MessageSink> Server<S> {
    /// Open the listening socket and register it with a fresh poller.
    pub fn bind(config: &Config, sink: S) -> Result<Self, ServerError> {
        let mut endpoint = ListeningEndpoint::open(config.port)?;
        let poller = Poller::new(config.batch_size).map_err(ServerError::Multiplexer)?;
        poller
            .register(endpoint.listener_mut(), LISTENER_TOKEN)
            .map_err(ServerError::Multiplexer)?;

        Ok(Self {
            endpoint,
            poller,
            connections: ConnectionTable::new(),
            sink,
            ready: Vec::with_capacity(config.batch_size),
            scratch: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serve until the poller fails.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr(), "Server started");
        loop {
            self.turn(None)?;
        }
    }

    /// Wait once for readiness and dispatch the whole batch.
    ///
    /// Returns the number of ready events handled.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, ServerError> {
        if let Err(e) = self.poller.wait(&mut self.ready, timeout) {
            error!(error = %e, "Poll failed, stopping event loop");
            return Err(ServerError::Wait(e));
        }

        let ready = std::mem::take(&mut self.ready);
        for &token in &ready {
            match token {
                LISTENER_TOKEN => self.accept_connections(),
                Token(id) => self.handle_readable(id as ConnectionId),
            }
        }
        let handled = ready.len();
        self.ready = ready;

        Ok(handled)
    }

    fn accept_connections(&mut self) {
        loop {
            match self.endpoint.listener().accept() {
                Ok((stream, peer)) => {
                    let mut conn = Connection::new(stream, peer);
                    let id = conn.id();

                    // On failure `conn` drops here, closing the socket.
                    if let Err(e) = self.poller.register(conn.stream_mut(), token_of(id)) {
                        warn!(conn_id = id, peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    self.connections.insert(conn);
                    info!(
                        conn_id = id,
                        peer = %peer,
                        live = self.connection_count(),
                        "New client connected"
                    );
                    self.sink.on_connect(id, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if peer_gave_up(e.kind()) => {
                    warn!(error = %e, "Pending connection dropped before accept");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, id: ConnectionId) {
        // Stale event for a descriptor torn down earlier in this batch.
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        if let DrainOutcome::Closed(reason) = conn.drain(&mut self.scratch, &mut self.sink) {
            self.close_connection(id, reason);
        }
    }

    fn close_connection(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(mut conn) = self.connections.remove(id) else {
            return;
        };
        if let Err(e) = self.poller.deregister(conn.stream_mut()) {
            debug!(conn_id = id, error = %e, "Deregister failed, closing anyway");
        }

        let live = self.connection_count();
        match &reason {
            DisconnectReason::PeerClosed => {
                info!(conn_id = id, peer = %conn.peer(), live, "Client disconnected")
            }
            DisconnectReason::ReadError(e) => {
                warn!(conn_id = id, peer = %conn.peer(), live, error = %e, "Client read error")
            }
        }
        if conn.pending() > 0 {
            debug!(conn_id = id, bytes = conn.pending(), "Discarding unterminated data");
        }

        self.sink.on_disconnect(id, &reason);
        // `conn` drops here, closing the socket.
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }
}
