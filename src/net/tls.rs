//! rustls session plumbing over a std `TcpStream`.
//!
//! Plaintext is read with `reader()`; when it runs dry, ciphertext is pulled
//! off the socket with `read_tls`, decrypted by `process_new_packets`, and
//! any handshake or alert records rustls queued are flushed back. Server
//! handshakes complete inside this read path; client handshakes are driven
//! to completion before the connection opens.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use super::socket::{Backoff, ReadOutcome};
use crate::error::{Error, Result};

pub(crate) fn server_session(config: Arc<ServerConfig>) -> Result<rustls::Connection> {
    Ok(rustls::Connection::Server(ServerConnection::new(config)?))
}

/// Runs a client handshake on `stream` while it is still blocking.
pub(crate) fn client_handshake(
    stream: &TcpStream,
    config: Arc<ClientConfig>,
    server_name: &str,
    timeout: Option<Duration>,
) -> Result<rustls::Connection> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| Error::InvalidServerName(server_name.to_string()))?;
    let mut session = rustls::Connection::Client(ClientConnection::new(config, name)?);

    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    let mut io = stream;
    while session.is_handshaking() {
        session.complete_io(&mut io)?;
    }
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;

    tracing::debug!(server_name, "tls handshake complete");
    Ok(session)
}

/// Reads plaintext into `buf`. `socket_reads` caps how many times the socket
/// itself may be read; it is decremented per read.
pub(crate) fn read(
    stream: &TcpStream,
    session: &mut rustls::Connection,
    buf: &mut [u8],
    socket_reads: &mut usize,
) -> io::Result<ReadOutcome> {
    loop {
        match session.reader().read(buf) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => return Ok(ReadOutcome::Data(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadOutcome::Eof),
            Err(err) => return Err(err),
        }

        if *socket_reads == 0 {
            return Ok(ReadOutcome::Pending);
        }
        *socket_reads -= 1;

        let mut io = stream;
        match session.read_tls(&mut io) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Pending),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }

        let processed = session.process_new_packets();
        // alerts queued by a failed process must still reach the peer
        let flushed = flush(stream, session, Some(Duration::from_secs(1)));
        if let Err(err) = processed {
            return Err(io::Error::new(io::ErrorKind::InvalidData, err));
        }
        flushed?;
    }
}

/// Queues plaintext and flushes every pending record.
pub(crate) fn write_all(
    stream: &TcpStream,
    session: &mut rustls::Connection,
    mut data: &[u8],
    timeout: Option<Duration>,
) -> io::Result<()> {
    while !data.is_empty() {
        let n = session.writer().write(data)?;
        data = &data[n..];
        if n == 0 || session.wants_write() {
            flush(stream, session, timeout)?;
        }
    }
    flush(stream, session, timeout)
}

pub(crate) fn flush(
    stream: &TcpStream,
    session: &mut rustls::Connection,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let mut backoff = Backoff::new(timeout);
    let mut io = stream;
    while session.wants_write() {
        match session.write_tls(&mut io) {
            Ok(_) => backoff.reset(),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => backoff.wait()?,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub(crate) fn close_notify(stream: &TcpStream, session: &mut rustls::Connection) {
    session.send_close_notify();
    if let Err(err) = flush(stream, session, Some(Duration::from_millis(100))) {
        tracing::trace!(error = %err, "close_notify not delivered");
    }
}
