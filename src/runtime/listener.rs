//! Listening socket setup.
//!
//! The server listens on all IPv4 interfaces only. Address and port reuse
//! are enabled before binding so a restart is not blocked by sockets in
//! TIME_WAIT, and so several processes may share the port.

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;

/// Setup step that failed while opening the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenStep {
    CreateSocket,
    ReuseAddress,
    ReusePort,
    NonBlocking,
    Bind,
    Listen,
    LocalAddr,
}

impl fmt::Display for ListenStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            ListenStep::CreateSocket => "create socket",
            ListenStep::ReuseAddress => "set SO_REUSEADDR",
            ListenStep::ReusePort => "set SO_REUSEPORT",
            ListenStep::NonBlocking => "set non-blocking",
            ListenStep::Bind => "bind",
            ListenStep::Listen => "listen",
            ListenStep::LocalAddr => "query local address",
        };
        f.write_str(step)
    }
}

#[derive(Debug)]
pub struct ListenError {
    pub step: ListenStep,
    pub source: io::Error,
}

impl fmt::Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to {}: {}", self.step, self.source)
    }
}

impl std::error::Error for ListenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

trait StepExt<T> {
    fn step(self, step: ListenStep) -> Result<T, ListenError>;
}

impl<T> StepExt<T> for io::Result<T> {
    fn step(self, step: ListenStep) -> Result<T, ListenError> {
        self.map_err(|source| ListenError { step, source })
    }
}

/// The bound, listening server socket.
#[derive(Debug)]
pub struct ListeningEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ListeningEndpoint {
    /// Open a non-blocking listener on `0.0.0.0:port`.
    ///
    /// Port 0 binds an ephemeral port; see [`ListeningEndpoint::local_addr`].
    pub fn open(port: u16) -> Result<Self, ListenError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .step(ListenStep::CreateSocket)?;
        info!("Socket created");

        socket
            .set_reuse_address(true)
            .step(ListenStep::ReuseAddress)?;
        socket.set_reuse_port(true).step(ListenStep::ReusePort)?;
        socket
            .set_nonblocking(true)
            .step(ListenStep::NonBlocking)?;

        socket.bind(&addr.into()).step(ListenStep::Bind)?;
        info!(addr = %addr, "Bind successful");

        socket.listen(libc::SOMAXCONN).step(ListenStep::Listen)?;
        info!(backlog = libc::SOMAXCONN, "Listen successful");

        let listener = TcpListener::from_std(socket.into());
        let local_addr = listener.local_addr().step(ListenStep::LocalAddr)?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn test_open_ephemeral_port() {
        let endpoint = ListeningEndpoint::open(0).unwrap();
        let addr = endpoint.local_addr();

        assert!(addr.is_ipv4());
        assert!(addr.ip().is_unspecified());
        assert_ne!(addr.port(), 0);

        TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port())).unwrap();
    }

    #[test]
    fn test_port_can_be_shared() {
        let first = ListeningEndpoint::open(0).unwrap();
        let second = ListeningEndpoint::open(first.local_addr().port()).unwrap();
        assert_eq!(first.local_addr(), second.local_addr());
    }

    #[test]
    fn test_bind_failure_names_step() {
        // A plain listener without SO_REUSEPORT blocks the port for us.
        let taken = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = ListeningEndpoint::open(port).unwrap_err();
        assert_eq!(err.step, ListenStep::Bind);
        assert!(err.to_string().starts_with("failed to bind"));
    }
}
