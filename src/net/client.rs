use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    sync::{Arc, RwLock},
};

use rustls::ClientConfig;

use super::{
    config::Options,
    connection::{Connection, Role, TransportKind, REASON_CLIENT_CLOSE},
    socket::Socket,
    tls,
};
use crate::{
    error::{Error, Result},
    handler::Handler,
    EventLoop,
};

/// Dials one server address and keeps the resulting connection.
///
/// TCP and TLS connections read through the engine's multiplexer like
/// accepted ones. UDP client connections only send.
pub struct Client {
    addr: String,
    handler: Arc<dyn Handler>,
    options: Options,
    event_loop: Arc<EventLoop>,
    connection: RwLock<Option<Arc<Connection>>>,
}

impl Client {
    /// Client on the process-wide [`EventLoop`].
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
            connection: RwLock::new(None),
        }
    }

    pub fn dial_tcp(&self) -> Result<Arc<Connection>> {
        let stream = self.connect_stream()?;
        self.establish(TransportKind::Tcp, Socket::Tcp(stream))
    }

    /// Dials TCP and completes the TLS handshake before the connection opens.
    pub fn dial_tls(&self, config: Arc<ClientConfig>, server_name: &str) -> Result<Arc<Connection>> {
        let stream = self.connect_stream()?;
        let session = tls::client_handshake(&stream, config, server_name, self.options.timeout())?;
        self.establish(TransportKind::Tls, Socket::tls(stream, session))
    }

    pub fn dial_udp(&self) -> Result<Arc<Connection>> {
        let target = resolve(&self.addr)?[0];
        let local = if target.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(target)?;
        self.establish(TransportKind::Udp, Socket::Udp(socket))
    }

    /// Writes through the dialed connection.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        match self.connection() {
            Some(conn) => conn.write(data),
            None => Err(Error::NotDialed),
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        match self.connection.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Closes the dialed connection with reason `"client close"`.
    pub fn close(&self) -> Result<()> {
        match self.connection() {
            Some(conn) => conn.close(REASON_CLIENT_CLOSE),
            None => Err(Error::NotDialed),
        }
    }

    fn connect_stream(&self) -> Result<TcpStream> {
        let mut last_err = None;
        for addr in resolve(&self.addr)? {
            let attempt = match self.options.timeout() {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(self.options.no_delay()) {
                        tracing::debug!(remote = %addr, error = %err, "TCP_NODELAY not applied");
                    }
                    return Ok(stream);
                }
                Err(err) => {
                    tracing::debug!(remote = %addr, error = %err, "dial attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
            .into())
    }

    fn establish(&self, kind: TransportKind, socket: Socket) -> Result<Arc<Connection>> {
        let conn = Connection::new(
            kind,
            Role::Client,
            socket,
            Arc::clone(&self.handler),
            self.options.clone(),
            Arc::clone(&self.event_loop),
        )?;
        conn.open()?;
        tracing::info!(
            conn_id = conn.id(),
            kind = ?kind,
            remote = %self.addr,
            "dialed"
        );

        let previous = match self.connection.write() {
            Ok(mut guard) => guard.replace(Arc::clone(&conn)),
            Err(poisoned) => poisoned.into_inner().replace(Arc::clone(&conn)),
        };
        if let Some(previous) = previous {
            let _ = previous.close(REASON_CLIENT_CLOSE);
        }
        Ok(conn)
    }
}

fn resolve(addr: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{addr} resolved to no addresses"),
        )
        .into());
    }
    Ok(addrs)
}
