//! Accepted client connections and the table that owns them.
//!
//! A connection is keyed by its socket descriptor, which the OS keeps
//! unique among open descriptors. An entry exists in the table exactly as
//! long as its socket is registered with the poller.

use crate::runtime::line_buffer::LineBuffer;
use crate::runtime::sink::MessageSink;
use mio::net::TcpStream;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// Connection identity: the client socket's file descriptor.
pub type ConnectionId = RawFd;

/// Size of each read issued against a ready socket.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Why a connection was torn down.
#[derive(Debug)]
pub enum DisconnectReason {
    /// Zero-byte read: the peer shut down its side.
    PeerClosed,
    /// Any read error other than `WouldBlock` / `Interrupted`.
    ReadError(io::Error),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "closed by peer"),
            DisconnectReason::ReadError(e) => write!(f, "read error: {e}"),
        }
    }
}

/// Result of draining a ready socket.
#[derive(Debug)]
pub enum DrainOutcome {
    /// Socket has no more data for now; keep the connection.
    Open,
    /// Connection must be torn down.
    Closed(DisconnectReason),
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: LineBuffer,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            buffer: LineBuffer::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Bytes buffered after the last delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Read everything the socket currently has, emitting each complete
    /// line to `sink` in arrival order.
    ///
    /// Reads are bounded by `scratch.len()` and repeated until the socket
    /// would block, since readiness is edge-triggered.
    pub fn drain<S: MessageSink>(&mut self, scratch: &mut [u8], sink: &mut S) -> DrainOutcome {
        let id = self.id();
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return DrainOutcome::Closed(DisconnectReason::PeerClosed),
                Ok(n) => {
                    self.buffer.extend(&scratch[..n]);
                    while let Some(line) = self.buffer.next_line() {
                        sink.on_message(id, &line);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return DrainOutcome::Open,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return DrainOutcome::Closed(DisconnectReason::ReadError(e)),
            }
        }
    }
}

/// Table of live connections keyed by descriptor.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under its own descriptor.
    pub fn insert(&mut self, conn: Connection) -> ConnectionId {
        let id = conn.id();
        self.connections.insert(id, conn);
        id
    }

    #[cfg(test)]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Shutdown, TcpListener};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Collect(Vec<(ConnectionId, Vec<u8>)>);

    impl MessageSink for Collect {
        fn on_message(&mut self, id: ConnectionId, message: &[u8]) {
            self.0.push((id, message.to_vec()));
        }
    }

    /// A connected (server side, client side) pair.
    fn pair() -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (Connection::new(TcpStream::from_std(server), peer), client)
    }

    /// Drain until `done` holds or the deadline passes; data may trickle in.
    fn drain_until(
        conn: &mut Connection,
        sink: &mut Collect,
        done: impl Fn(&Collect, &DrainOutcome) -> bool,
    ) -> DrainOutcome {
        let mut scratch = [0u8; READ_CHUNK_SIZE];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let outcome = conn.drain(&mut scratch, sink);
            if done(sink, &outcome) || Instant::now() > deadline {
                return outcome;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_drain_emits_lines_tagged_with_id() {
        let (mut conn, mut client) = pair();
        let id = conn.id();
        let mut sink = Collect::default();

        client.write_all(b"x\ny\nz").unwrap();
        let outcome = drain_until(&mut conn, &mut sink, |s, _| s.0.len() == 2);

        assert!(matches!(outcome, DrainOutcome::Open));
        assert_eq!(sink.0, vec![(id, b"x".to_vec()), (id, b"y".to_vec())]);
        assert_eq!(conn.pending(), 1);
    }

    #[test]
    fn test_drain_reports_peer_close_without_flushing_partial() {
        let (mut conn, mut client) = pair();
        let mut sink = Collect::default();

        client.write_all(b"partial").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let outcome = drain_until(&mut conn, &mut sink, |_, o| {
            matches!(o, DrainOutcome::Closed(_))
        });

        assert!(matches!(
            outcome,
            DrainOutcome::Closed(DisconnectReason::PeerClosed)
        ));
        assert!(sink.0.is_empty());
        assert_eq!(conn.pending(), b"partial".len());
    }

    #[test]
    fn test_drain_larger_than_one_chunk() {
        let (mut conn, mut client) = pair();
        let mut sink = Collect::default();

        let long = vec![b'a'; READ_CHUNK_SIZE * 3 + 17];
        let mut payload = long.clone();
        payload.push(b'\n');
        client.write_all(&payload).unwrap();
        drain_until(&mut conn, &mut sink, |s, _| !s.0.is_empty());

        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].1, long);
    }

    #[test]
    fn test_table_keyed_by_descriptor() {
        let (a, _client_a) = pair();
        let (b, _client_b) = pair();
        let (id_a, id_b) = (a.id(), b.id());

        let mut table = ConnectionTable::new();
        assert!(table.is_empty());
        assert_eq!(table.insert(a), id_a);
        assert_eq!(table.insert(b), id_b);
        assert_ne!(id_a, id_b);
        assert_eq!(table.len(), 2);
        assert!(table.get(id_a).is_some());

        let removed = table.remove(id_a).unwrap();
        assert_eq!(removed.id(), id_a);
        assert!(!table.contains(id_a));
        assert!(table.remove(id_a).is_none());
        assert_eq!(table.len(), 1);
    }
}
