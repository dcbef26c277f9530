//! Connection lifecycle, read path and write path.
//!
//! ```text
//!   readiness ──▶ Multiplexer callback ──▶ Worker::run(read task)
//!                                              │
//!         read into pooled buffer (drain until WouldBlock on edge mode)
//!                                              │
//!                     decrypt ──▶ FrameBuffer::write  or  Handler::on_message
//!
//!   Connection::write ──▶ encrypt ──▶ socket (backoff while the buffer is full)
//!
//!   Connection::close ──▶ flag ──▶ registry ──▶ on_close ──▶ hook
//!                              ──▶ Multiplexer::stop ──▶ socket shutdown ──▶ Worker::close
//! ```

use std::{
    borrow::Cow,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    thread::{self, Builder},
    time::Duration,
};

use serde_json::{Map, Value};

use super::{
    config::Options,
    socket::{ReadOutcome, Socket},
};
use crate::{
    encrypt::Method,
    error::{Error, Result},
    event::Readiness,
    handler::Handler,
    message::FrameBuffer,
    poll::{Descriptor, IoMode, ReadyFn},
    utils::deadline_after,
    worker::Worker,
    EventLoop,
};

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_CLIENT_CLOSE: &str = "client close";
pub const REASON_PEER_HANG_UP: &str = "peer hang-up";

/// How often the datagram loop looks at the closed flag.
const DATAGRAM_POLL_SLICE: Duration = Duration::from_millis(200);
/// Pause after a failed datagram receive.
const DATAGRAM_ERROR_BACKOFF: Duration = Duration::from_millis(50);
/// Consecutive receive failures that close a datagram connection.
const DATAGRAM_MAX_ERRORS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// One live socket endpoint.
///
/// Created by a [`Server`](super::Server) on accept or a
/// [`Client`](super::Client) on dial, and handed to the [`Handler`] as an
/// `Arc`. Closing is one-way and happens once; later calls succeed without
/// doing anything.
pub struct Connection {
    id: u64,
    kind: TransportKind,
    role: Role,
    socket: Socket,
    handler: Arc<dyn Handler>,
    options: Options,
    method: Option<Box<dyn Method>>,
    buffer: RwLock<Option<Arc<FrameBuffer>>>,
    remote: RwLock<Option<SocketAddr>>,
    closed: RwLock<bool>,
    worker: Worker,
    /// A read task is queued and has not started draining yet.
    read_queued: AtomicBool,
    descriptor: OnceLock<Descriptor>,
    event_loop: Arc<EventLoop>,
    context: Mutex<Map<String, Value>>,
    on_close: Mutex<Option<CloseHook>>,
    write_lock: Mutex<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("remote", &self.cached_remote())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        kind: TransportKind,
        role: Role,
        socket: Socket,
        handler: Arc<dyn Handler>,
        options: Options,
        event_loop: Arc<EventLoop>,
    ) -> Result<Arc<Self>> {
        let method = options.new_method()?;
        let id = event_loop.registry().next_id();
        let remote = match kind {
            TransportKind::Udp => None,
            _ => socket.peer_addr().ok(),
        };

        Ok(Arc::new(Self {
            id,
            kind,
            role,
            socket,
            handler,
            options,
            method,
            buffer: RwLock::new(None),
            remote: RwLock::new(remote),
            closed: RwLock::new(false),
            worker: event_loop.new_worker(),
            read_queued: AtomicBool::new(false),
            descriptor: OnceLock::new(),
            event_loop,
            context: Mutex::new(Map::new()),
            on_close: Mutex::new(None),
            write_lock: Mutex::new(()),
        }))
    }

    /// Registers the connection and starts its read path. Stream transports
    /// get `on_connect` first; UDP servers get it per datagram instead, and
    /// UDP clients never read.
    pub(crate) fn open(self: &Arc<Self>) -> Result<()> {
        self.event_loop.registry().insert(Arc::clone(self));
        tracing::info!(
            conn_id = self.id,
            kind = ?self.kind,
            role = ?self.role,
            remote = %self.remote_addr(),
            "connection opened"
        );

        let started = match self.kind {
            TransportKind::Tcp | TransportKind::Tls => {
                self.handler.on_connect(self);
                if self.is_closed() {
                    return Ok(());
                }
                self.start_stream_reads()
            }
            TransportKind::Udp if self.role == Role::Server => self.start_datagram_reads(),
            TransportKind::Udp => Ok(()),
        };

        if let Err(err) = started {
            tracing::error!(conn_id = self.id, error = %err, "read path failed to start");
            let _ = self.close(&format!("register error: {err}"));
            return Err(err);
        }
        Ok(())
    }

    fn start_stream_reads(self: &Arc<Self>) -> Result<()> {
        let Some(stream) = self.socket.stream() else {
            return Ok(());
        };
        let multiplexer = self.event_loop.multiplexer();
        match multiplexer.mode() {
            IoMode::EdgeTriggered => self.socket.set_nonblocking(true)?,
            IoMode::Blocking => self.socket.set_nonblocking(false)?,
        }

        let weak: Weak<Connection> = Arc::downgrade(self);
        let on_ready: ReadyFn = Arc::new(move |ready: Readiness| {
            if let Some(conn) = weak.upgrade() {
                conn.schedule_read(ready);
            }
        });

        let descriptor = multiplexer.register(stream, on_ready)?;
        let _ = self.descriptor.set(descriptor);
        multiplexer.set_deadline(descriptor, deadline_after(self.options.timeout()));

        if self.kind == TransportKind::Tls {
            // records taken in during the handshake never raise readiness again
            let conn = Arc::clone(self);
            self.worker.run(move || conn.drain(descriptor, 0, false));
        }
        Ok(())
    }

    /// Queues a read task for `ready` on the worker. A queued drain reads
    /// until `WouldBlock`, so plain readable events fold into one already
    /// waiting; hang-ups and timeouts always get their own task.
    fn schedule_read(self: &Arc<Self>, ready: Readiness) {
        let plain = !ready.is_hang_up() && !ready.is_timed_out();
        if plain && self.read_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = Arc::clone(self);
        if !self.worker.run(move || conn.handle_ready(ready)) && plain {
            self.read_queued.store(false, Ordering::Release);
        }
    }

    /// Read task scheduled on the worker for every readiness event.
    fn handle_ready(self: &Arc<Self>, ready: Readiness) {
        if !ready.is_hang_up() && !ready.is_timed_out() {
            self.read_queued.store(false, Ordering::Release);
        }
        if self.is_closed() {
            return;
        }
        if ready.is_timed_out() {
            let _ = self.close(REASON_TIMEOUT);
            return;
        }

        let socket_reads = match self.event_loop.multiplexer().mode() {
            IoMode::EdgeTriggered => usize::MAX,
            IoMode::Blocking => 1,
        };
        self.drain(ready.descriptor(), socket_reads, ready.is_hang_up());
    }

    fn drain(self: &Arc<Self>, descriptor: Descriptor, mut socket_reads: usize, hang_up: bool) {
        let multiplexer = self.event_loop.multiplexer();
        let mut buf = self.event_loop.byte_pool().acquire();
        let mut total = 0usize;

        loop {
            if self.is_closed() {
                return;
            }
            match self.socket.read(&mut buf, &mut socket_reads) {
                Ok(ReadOutcome::Data(n)) => {
                    total += n;
                    multiplexer.set_deadline(descriptor, deadline_after(self.options.timeout()));
                    self.deliver(&buf[..n]);
                }
                Ok(ReadOutcome::Pending) => break,
                Ok(ReadOutcome::Eof) => {
                    tracing::debug!(conn_id = self.id, total, "read drained to eof");
                    let reason = if hang_up {
                        REASON_PEER_HANG_UP
                    } else {
                        REASON_CLIENT_CLOSE
                    };
                    let _ = self.close(reason);
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    let _ = self.close(REASON_TIMEOUT);
                    return;
                }
                Err(err) => {
                    tracing::debug!(conn_id = self.id, error = %err, "read failed");
                    let _ = self.close(&format!("read error: {err}"));
                    return;
                }
            }
        }

        if total > 0 {
            tracing::trace!(conn_id = self.id, total, "read drained");
        }
        multiplexer.rearm(descriptor);
    }

    /// Decrypts one received chunk and routes it to the frame buffer or the
    /// handler.
    fn deliver(self: &Arc<Self>, data: &[u8]) {
        // a close that raced the read discards what it returned
        if self.is_closed() {
            return;
        }
        let plain: Cow<'_, [u8]> = match &self.method {
            None => Cow::Borrowed(data),
            Some(method) => match method.decrypt(data) {
                Ok(plain) => Cow::Owned(plain),
                Err(err) => {
                    tracing::error!(conn_id = self.id, error = %err, "decrypt failed");
                    if self.kind != TransportKind::Udp {
                        let _ = self.close(&format!("decrypt error: {err}"));
                    }
                    return;
                }
            },
        };

        if self.is_closed() {
            return;
        }
        let buffer = read_lock(&self.buffer).clone();
        match buffer {
            Some(buffer) => buffer.write(&plain),
            None => self.handler.on_message(self, &plain),
        }
    }

    fn start_datagram_reads(self: &Arc<Self>) -> Result<()> {
        let Some(socket) = self.socket.udp() else {
            return Ok(());
        };
        let socket = socket.try_clone()?;
        socket.set_read_timeout(Some(DATAGRAM_POLL_SLICE))?;

        let conn = Arc::clone(self);
        Builder::new()
            .name(format!("mill-conn-udp-{}", self.id))
            .spawn(move || conn.datagram_loop(|buf| socket.recv_from(buf)))?;
        Ok(())
    }

    /// Receives until the connection closes. Persistent receive failures
    /// back off, and close the connection once too many come in a row.
    fn datagram_loop<R>(self: &Arc<Self>, mut recv: R)
    where
        R: FnMut(&mut [u8]) -> io::Result<(usize, SocketAddr)>,
    {
        let mut buf = self.event_loop.byte_pool().acquire();
        let mut failures = 0u32;
        while !self.is_closed() {
            match recv(&mut buf[..]) {
                Ok((n, from)) => {
                    failures = 0;
                    self.on_datagram(&buf[..n], from);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    failures += 1;
                    tracing::error!(conn_id = self.id, failures, error = %err, "datagram read failed");
                    if failures >= DATAGRAM_MAX_ERRORS {
                        let _ = self.close(&format!("read error: {err}"));
                        break;
                    }
                    thread::sleep(DATAGRAM_ERROR_BACKOFF);
                }
            }
        }
        tracing::debug!(conn_id = self.id, "datagram loop stopped");
    }

    fn on_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        *write_lock(&self.remote) = Some(from);
        self.handler.on_connect(self);
        if !data.is_empty() && !self.is_closed() {
            self.deliver(data);
        }
    }

    /// Encrypts `data` when a method is configured and writes all of it.
    /// Returns the number of plaintext bytes accepted.
    ///
    /// An encryption failure closes the connection.
    pub fn write(self: &Arc<Self>, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let payload: Cow<'_, [u8]> = match &self.method {
            None => Cow::Borrowed(data),
            Some(method) => match method.encrypt(data) {
                Ok(sealed) => Cow::Owned(sealed),
                Err(err) => {
                    tracing::error!(conn_id = self.id, error = %err, "encrypt failed");
                    let _ = self.close(&format!("encrypt error: {err}"));
                    return Err(err.into());
                }
            },
        };

        let destination = match (self.kind, self.role) {
            (TransportKind::Udp, Role::Server) => {
                let remote = *read_lock(&self.remote);
                match remote {
                    Some(addr) => Some(addr),
                    None => return Err(io::Error::from(io::ErrorKind::NotConnected).into()),
                }
            }
            _ => None,
        };

        let _serial = lock(&self.write_lock);
        self.socket
            .write_all(&payload, destination, self.options.timeout())?;
        Ok(data.len())
    }

    /// Closes the connection. Only the first call does anything: it fires
    /// `on_close` with `reason`, runs the close hook, stops readiness
    /// dispatch, shuts the socket down and closes the worker. Returns the
    /// socket shutdown error, if any.
    pub fn close(self: &Arc<Self>, reason: &str) -> Result<()> {
        {
            let mut closed = write_lock(&self.closed);
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        self.event_loop.registry().remove(self.id);
        tracing::info!(conn_id = self.id, reason, "connection closed");

        self.handler.on_close(self, reason);
        if let Some(hook) = lock(&self.on_close).take() {
            hook();
        }

        if let Some(descriptor) = self.descriptor.get() {
            if let Err(err) = self.event_loop.multiplexer().stop(*descriptor) {
                tracing::warn!(conn_id = self.id, error = %err, "deregister failed");
            }
        }
        let shutdown = self.socket.shutdown();
        self.worker.close();

        shutdown.map_err(Error::from)
    }

    pub fn is_closed(&self) -> bool {
        *read_lock(&self.closed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Remote address as text, cached after the first lookup. Empty when it
    /// was never known and the connection is closed.
    pub fn remote_addr(&self) -> String {
        self.peer_addr().map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.cached_remote() {
            return Some(addr);
        }
        if self.is_closed() || (self.kind == TransportKind::Udp && self.role == Role::Server) {
            return None;
        }
        let addr = self.socket.peer_addr().ok()?;
        *write_lock(&self.remote) = Some(addr);
        Some(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn cached_remote(&self) -> Option<SocketAddr> {
        *read_lock(&self.remote)
    }

    /// Routes every later inbound chunk to `buffer` instead of
    /// [`Handler::on_message`].
    pub fn set_buffer(&self, buffer: impl Into<Arc<FrameBuffer>>) -> Result<()> {
        if self.kind == TransportKind::Udp && self.role == Role::Client {
            return Err(Error::BufferUnsupported);
        }
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        *write_lock(&self.buffer) = Some(buffer.into());
        Ok(())
    }

    pub fn buffer(&self) -> Option<Arc<FrameBuffer>> {
        read_lock(&self.buffer).clone()
    }

    /// Runs `hook` once, right after `on_close`.
    pub fn set_on_close<F>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        *lock(&self.on_close) = Some(Box::new(hook));
        Ok(())
    }

    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        lock(&self.context).insert(key.into(), value);
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        lock(&self.context).get(key).cloned()
    }

    pub fn remove_value(&self, key: &str) -> Option<Value> {
        lock(&self.context).remove(key)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
