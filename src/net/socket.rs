use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, UdpSocket},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use super::tls;

const BACKOFF_START: Duration = Duration::from_micros(50);
const BACKOFF_MAX: Duration = Duration::from_millis(1);

/// Result of one nonblocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Data(usize),
    /// Nothing more to read right now.
    Pending,
    Eof,
}

/// Sleeps between retries of a write that hit a full socket buffer, giving
/// up once `timeout` passes without progress.
pub(crate) struct Backoff {
    delay: Duration,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            delay: BACKOFF_START,
            timeout,
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.timeout);
    }

    pub(crate) fn wait(&mut self) -> io::Result<()> {
        if matches!(self.deadline, Some(at) if Instant::now() >= at) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        std::thread::sleep(self.delay);
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
        Ok(())
    }
}

/// The transport under a connection.
pub(crate) enum Socket {
    Tcp(TcpStream),
    Tls {
        stream: TcpStream,
        session: Mutex<rustls::Connection>,
    },
    Udp(UdpSocket),
}

impl Socket {
    pub(crate) fn tls(stream: TcpStream, session: rustls::Connection) -> Self {
        Socket::Tls {
            stream,
            session: Mutex::new(session),
        }
    }

    /// Stream watched by the multiplexer; `None` for UDP.
    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        match self {
            Socket::Tcp(stream) | Socket::Tls { stream, .. } => Some(stream),
            Socket::Udp(_) => None,
        }
    }

    pub(crate) fn udp(&self) -> Option<&UdpSocket> {
        match self {
            Socket::Udp(socket) => Some(socket),
            _ => None,
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) | Socket::Tls { stream, .. } => stream.set_nonblocking(nonblocking),
            Socket::Udp(socket) => socket.set_nonblocking(nonblocking),
        }
    }

    /// Reads once into `buf`. `socket_reads` limits the number of reads on
    /// the OS socket; at zero the call reports `Pending` without touching it.
    pub(crate) fn read(&self, buf: &mut [u8], socket_reads: &mut usize) -> io::Result<ReadOutcome> {
        match self {
            Socket::Tcp(stream) => loop {
                if *socket_reads == 0 {
                    return Ok(ReadOutcome::Pending);
                }
                *socket_reads -= 1;
                let mut io = stream;
                match io.read(buf) {
                    Ok(0) => return Ok(ReadOutcome::Eof),
                    Ok(n) => return Ok(ReadOutcome::Data(n)),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(ReadOutcome::Pending)
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(err),
                }
            },
            Socket::Tls { stream, session } => {
                tls::read(stream, &mut lock(session), buf, socket_reads)
            }
            // datagrams are consumed by the receive loop
            Socket::Udp(_) => Ok(ReadOutcome::Pending),
        }
    }

    /// Writes all of `data`, retrying with backoff while the socket buffer is
    /// full. `to` is the datagram destination for unconnected UDP sockets.
    pub(crate) fn write_all(
        &self,
        data: &[u8],
        to: Option<SocketAddr>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) => {
                let mut backoff = Backoff::new(timeout);
                let mut io = stream;
                let mut rest = data;
                while !rest.is_empty() {
                    match io.write(rest) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => {
                            rest = &rest[n..];
                            backoff.reset();
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => backoff.wait()?,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
            Socket::Tls { stream, session } => {
                tls::write_all(stream, &mut lock(session), data, timeout)
            }
            Socket::Udp(socket) => {
                let sent = match to {
                    Some(addr) => socket.send_to(data, addr)?,
                    None => socket.send(data)?,
                };
                if sent < data.len() {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "datagram truncated"));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(stream) | Socket::Tls { stream, .. } => stream.peer_addr(),
            Socket::Udp(socket) => socket.peer_addr(),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(stream) | Socket::Tls { stream, .. } => stream.local_addr(),
            Socket::Udp(socket) => socket.local_addr(),
        }
    }

    /// Shuts both directions down. The descriptor itself is released when
    /// the socket drops.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        let stream = match self {
            Socket::Tcp(stream) => stream,
            Socket::Tls { stream, session } => {
                tls::close_notify(stream, &mut lock(session));
                stream
            }
            Socket::Udp(_) => return Ok(()),
        };
        match stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
