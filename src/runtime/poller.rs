//! Readiness multiplexer.
//!
//! Thin wrapper over `mio::Poll` (epoll on Linux, kqueue on macOS) that
//! watches sources for readability and hands back the tokens that became
//! ready. Readiness is edge-triggered: callers must consume a source until
//! it would block before waiting again.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;

pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    /// Create a poller returning at most `batch_size` events per wait.
    pub fn new(batch_size: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(batch_size),
        })
    }

    /// Watch `source` for readable data under `token`.
    pub fn register<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, token, Interest::READABLE)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Block until at least one source is ready or `timeout` elapses
    /// (`None` waits indefinitely). Ready tokens replace the contents of
    /// `ready`, in the order the OS reported them.
    ///
    /// Signal interruptions are retried; any other error is returned.
    pub fn wait(&mut self, ready: &mut Vec<Token>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        ready.extend(self.events.iter().map(|event| event.token()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::net::TcpStream;

    #[test]
    fn test_wait_times_out_with_nothing_ready() {
        let mut poller = Poller::new(4).unwrap();
        let mut ready = vec![Token(99)];

        poller
            .wait(&mut ready, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_registered_listener_becomes_ready() {
        let mut poller = Poller::new(4).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        poller.register(&mut listener, Token(7)).unwrap();

        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut ready = Vec::new();
        poller
            .wait(&mut ready, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(ready, vec![Token(7)]);
    }

    #[test]
    fn test_deregistered_source_is_silent() {
        let mut poller = Poller::new(4).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        poller.register(&mut listener, Token(7)).unwrap();
        poller.deregister(&mut listener).unwrap();

        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut ready = Vec::new();
        poller
            .wait(&mut ready, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(ready.is_empty());
    }
}
