//! Readiness multiplexing seam.
//!
//! The connection layer only talks to [`Multiplexer`]. Two implementations
//! exist: the mio [`Reactor`](crate::reactor::Reactor) (edge-triggered,
//! nonblocking sockets, one poller thread for every connection) and the
//! [`BlockingPoller`](crate::blocking::BlockingPoller) fallback (one watcher
//! thread per socket, sockets stay blocking).

use std::{fmt, net::TcpStream, sync::Arc, time::Instant};

use mio::Token;

use crate::{error::Result, event::Readiness};

/// Callback invoked by a multiplexer when a registered socket is ready.
///
/// It runs on the multiplexer's own thread and must not block: the
/// connection layer only forwards it to the connection's worker.
pub type ReadyFn = Arc<dyn Fn(Readiness) + Send + Sync>;

/// Handle for one registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const fn new(raw: u64) -> Self {
        Descriptor(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({})", self.0)
    }
}

impl From<Token> for Descriptor {
    fn from(token: Token) -> Self {
        Descriptor(token.0 as u64)
    }
}

impl From<Descriptor> for Token {
    fn from(descriptor: Descriptor) -> Self {
        Token(descriptor.0 as usize)
    }
}

/// How the read task must consume a socket after a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Socket is nonblocking; read until `WouldBlock` before returning.
    EdgeTriggered,
    /// Socket stays blocking; read once, then `rearm`.
    Blocking,
}

/// Which multiplexer an [`EventLoop`](crate::EventLoop) runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerKind {
    /// Shared readiness poller where the platform supports one.
    #[default]
    Readiness,
    /// Portable per-socket watcher threads.
    Blocking,
}

pub trait Multiplexer: Send + Sync {
    /// Starts watching `stream` for readability. Only the raw handle is
    /// used; the caller keeps the stream open until after [`stop`].
    ///
    /// [`stop`]: Multiplexer::stop
    fn register(&self, stream: &TcpStream, on_ready: ReadyFn) -> Result<Descriptor>;

    /// Deregisters. Once this returns no new readiness is dispatched for
    /// `descriptor`; a callback already running may still finish.
    fn stop(&self, descriptor: Descriptor) -> Result<()>;

    /// Arms (or with `None`, clears) the read deadline. When it passes the
    /// callback receives exactly one timed-out readiness.
    fn set_deadline(&self, descriptor: Descriptor, deadline: Option<Instant>);

    /// Resumes watching after a read task consumed a readiness.
    fn rearm(&self, descriptor: Descriptor);

    fn mode(&self) -> IoMode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_token_conversion() {
        let d = Descriptor::new(42);
        let token: Token = d.into();
        assert_eq!(token, Token(42));
        assert_eq!(Descriptor::from(token), d);
        assert_eq!(format!("{d:?}"), "Descriptor(42)");
    }

    #[test]
    fn test_default_kind_is_readiness() {
        assert_eq!(PollerKind::default(), PollerKind::Readiness);
    }
}
