//! Accept loops for TCP, TLS and UDP servers.
//!
//! ```text
//! Listener::run()
//!   accept() ──> live >= max_connections? ──> drop + warn
//!            ──> TCP_NODELAY
//!            ──> Socket::Tcp | Socket::Tls(server session)
//!            ──> Connection::new + open (registry, on_connect, multiplexer)
//!
//! DatagramListener
//!   bind() ──> one server-role Connection reading every datagram
//! ```
//!
//! Accept errors are logged and the loop keeps going; only a [`StopHandle`]
//! ends it.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use rustls::ServerConfig;
use socket2::{Domain, Protocol, Type};

use super::{
    config::Options,
    connection::{Connection, Role, TransportKind},
    socket::Socket,
    tls,
};
use crate::{error::Result, handler::Handler, EventLoop};

const ACCEPT_RETRY: Duration = Duration::from_millis(10);
const DATAGRAM_WAIT: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: i32 = 1024;

/// Server endpoint bound to one address, handler and option set.
pub struct Server {
    addr: String,
    handler: Arc<dyn Handler>,
    options: Options,
    event_loop: Arc<EventLoop>,
}

impl Server {
    /// Server on the process-wide [`EventLoop`].
    pub fn new<H: Handler>(addr: impl Into<String>, handler: H, options: Options) -> Result<Self> {
        Ok(Self::with_event_loop(addr, handler, options, EventLoop::shared()?))
    }

    pub fn with_event_loop<H: Handler>(
        addr: impl Into<String>,
        handler: H,
        options: Options,
        event_loop: Arc<EventLoop>,
    ) -> Self {
        Self {
            addr: addr.into(),
            handler: Arc::new(handler),
            options,
            event_loop,
        }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Binds a TCP listener without accepting yet.
    pub fn listen_tcp(&self) -> Result<Listener> {
        self.listen(None)
    }

    /// Binds a TLS listener; handshakes complete on each connection's read path.
    pub fn listen_tls(&self, config: Arc<ServerConfig>) -> Result<Listener> {
        self.listen(Some(config))
    }

    /// Binds and accepts TCP connections until stopped.
    pub fn run_tcp(&self) -> Result<()> {
        self.listen_tcp()?.run()
    }

    pub fn run_tls(&self, config: Arc<ServerConfig>) -> Result<()> {
        self.listen_tls(config)?.run()
    }

    /// Binds a UDP socket and starts reading datagrams.
    pub fn bind_udp(&self) -> Result<DatagramListener> {
        let socket = bind_datagram(&self.addr, self.options.reuse_port())?;
        let local_addr = socket.local_addr()?;
        let conn = Connection::new(
            TransportKind::Udp,
            Role::Server,
            Socket::Udp(socket),
            Arc::clone(&self.handler),
            self.options.clone(),
            Arc::clone(&self.event_loop),
        )?;
        conn.open()?;
        tracing::info!(addr = %local_addr, conn_id = conn.id(), "udp server listening");

        Ok(DatagramListener {
            connection: conn,
            local_addr,
        })
    }

    /// Binds a UDP socket and blocks until its connection closes.
    pub fn run_udp(&self) -> Result<()> {
        self.bind_udp()?.run();
        Ok(())
    }

    fn listen(&self, tls: Option<Arc<ServerConfig>>) -> Result<Listener> {
        let listener = bind_stream(&self.addr, self.options.reuse_port())?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            tls = tls.is_some(),
            "server listening"
        );

        Ok(Listener {
            listener,
            local_addr,
            tls,
            handler: Arc::clone(&self.handler),
            options: self.options.clone(),
            event_loop: Arc::clone(&self.event_loop),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn bind_stream(addr: &str, reuse_port: bool) -> io::Result<TcpListener> {
    if !reuse_port {
        return TcpListener::bind(addr);
    }
    let socket = reusable(first_addr(addr)?, Type::STREAM, Protocol::TCP)?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn bind_datagram(addr: &str, reuse_port: bool) -> io::Result<UdpSocket> {
    if !reuse_port {
        return UdpSocket::bind(addr);
    }
    Ok(reusable(first_addr(addr)?, Type::DGRAM, Protocol::UDP)?.into())
}

fn reusable(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn first_addr(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{addr} resolved to no addresses"),
        )
    })
}

/// A bound TCP or TLS listener. [`run`](Listener::run) blocks in accept.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<Arc<ServerConfig>>,
    handler: Arc<dyn Handler>,
    options: Options,
    event_loop: Arc<EventLoop>,
    stopped: Arc<AtomicBool>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: Arc::clone(&self.stopped),
            addr: self.local_addr,
        }
    }

    /// Accepts connections until [`StopHandle::stop`] is called.
    pub fn run(&self) -> Result<()> {
        while !self.stopped.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = self.admit(stream, peer) {
                        tracing::warn!(remote = %peer, error = %err, "connection not admitted");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    thread::sleep(ACCEPT_RETRY);
                }
            }
        }
        tracing::info!(addr = %self.local_addr, "server stopped");
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Some(max) = self.options.max_connections() {
            if self.event_loop.registry().live() >= max {
                tracing::warn!(remote = %peer, max, "max connections reached, rejecting");
                return Ok(());
            }
        }

        if let Err(err) = stream.set_nodelay(self.options.no_delay()) {
            tracing::debug!(remote = %peer, error = %err, "TCP_NODELAY not applied");
        }

        let (kind, socket) = match &self.tls {
            None => (TransportKind::Tcp, Socket::Tcp(stream)),
            Some(config) => {
                let session = tls::server_session(Arc::clone(config))?;
                (TransportKind::Tls, Socket::tls(stream, session))
            }
        };

        let conn = Connection::new(
            kind,
            Role::Server,
            socket,
            Arc::clone(&self.handler),
            self.options.clone(),
            Arc::clone(&self.event_loop),
        )?;
        conn.open()
    }
}

/// Ends a [`Listener::run`] loop from another thread.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl StopHandle {
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // accept only returns once something connects
        let mut wake = self.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        if let Err(err) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            tracing::debug!(addr = %wake, error = %err, "listener wake-up failed");
        }
    }
}

/// The single server-role connection behind a bound UDP socket.
pub struct DatagramListener {
    connection: Arc<Connection>,
    local_addr: SocketAddr,
}

impl DatagramListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Blocks until the connection is closed.
    pub fn run(&self) {
        while !self.connection.is_closed() {
            thread::sleep(DATAGRAM_WAIT);
        }
    }

    pub fn close(&self) -> Result<()> {
        self.connection.close(super::connection::REASON_CLIENT_CLOSE)
    }
}
