//! mio-backed readiness multiplexer shared by every TCP and TLS connection.
//!
//! A dedicated poller thread owns the [`mio::Poll`]. Other threads register
//! and deregister through a cloned [`mio::Registry`], so registration never
//! waits for a poll round. Sockets are watched edge-triggered for
//! readability; after every poll round the thread also fires read deadlines
//! that have passed.

use std::{
    collections::HashMap,
    io,
    net::TcpStream,
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::{self, Builder, JoinHandle},
    time::{Duration, Instant},
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};

use crate::{
    error::{Error, Result},
    event::Readiness,
    poll::{Descriptor, IoMode, Multiplexer, ReadyFn},
};

const WAKER_TOKEN: Token = Token(0);

struct Entry {
    on_ready: ReadyFn,
    deadline: Mutex<Option<Instant>>,
    fd: RawFd,
}

struct Shared {
    registry: mio::Registry,
    entries: RwLock<HashMap<Token, Arc<Entry>>>,
    next_token: AtomicUsize,
    running: AtomicBool,
}

pub struct Reactor {
    shared: Arc<Shared>,
    waker: Waker,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    pub fn new(events_capacity: usize, poll_timeout: Duration) -> Result<Self> {
        if events_capacity == 0 {
            return Err(Error::Config("events capacity must be positive".into()));
        }
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            entries: RwLock::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            running: AtomicBool::new(true),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = Builder::new()
            .name("mill-conn-poller".into())
            .spawn(move || poll_loop(poll, thread_shared, events_capacity, poll_timeout))?;

        Ok(Self {
            shared,
            waker,
            thread: Some(thread),
        })
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.shared.read_entries().len()
    }
}

impl Multiplexer for Reactor {
    fn register(&self, stream: &TcpStream, on_ready: ReadyFn) -> Result<Descriptor> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let fd = stream.as_raw_fd();
        let entry = Arc::new(Entry {
            on_ready,
            deadline: Mutex::new(None),
            fd,
        });

        // visible to the poller before the first event can arrive
        self.shared.write_entries().insert(token, entry);
        if let Err(err) = self
            .shared
            .registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            self.shared.write_entries().remove(&token);
            tracing::error!(fd, error = %err, "poller registration failed");
            return Err(err.into());
        }

        tracing::trace!(descriptor = token.0, fd, "registered");
        Ok(Descriptor::from(token))
    }

    fn stop(&self, descriptor: Descriptor) -> Result<()> {
        let token = Token::from(descriptor);
        let entry = self.shared.write_entries().remove(&token);
        match entry {
            Some(entry) => {
                self.shared.registry.deregister(&mut SourceFd(&entry.fd))?;
                tracing::trace!(descriptor = token.0, "deregistered");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn set_deadline(&self, descriptor: Descriptor, deadline: Option<Instant>) {
        let entry = self
            .shared
            .read_entries()
            .get(&Token::from(descriptor))
            .cloned();
        if let Some(entry) = entry {
            *lock(&entry.deadline) = deadline;
        }
    }

    fn rearm(&self, _descriptor: Descriptor) {}

    fn mode(&self) -> IoMode {
        IoMode::EdgeTriggered
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            tracing::warn!(error = %err, "failed to wake poller for shutdown");
        }
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Shared {
    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Token, Arc<Entry>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Token, Arc<Entry>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn dispatch(&self, readiness: Readiness) {
        let entry = self
            .read_entries()
            .get(&Token::from(readiness.descriptor()))
            .cloned();
        if let Some(entry) = entry {
            (entry.on_ready)(readiness);
        }
    }

    fn fire_deadlines(&self) {
        let now = Instant::now();
        let expired: Vec<(Token, Arc<Entry>)> = self
            .read_entries()
            .iter()
            .filter_map(|(token, entry)| {
                let mut deadline = lock(&entry.deadline);
                match *deadline {
                    Some(at) if at <= now => {
                        *deadline = None;
                        Some((*token, Arc::clone(entry)))
                    }
                    _ => None,
                }
            })
            .collect();

        for (token, entry) in expired {
            tracing::debug!(descriptor = token.0, "read deadline passed");
            (entry.on_ready)(Readiness::timed_out(Descriptor::from(token)));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn poll_loop(mut poll: Poll, shared: Arc<Shared>, capacity: usize, timeout: Duration) {
    let mut events = Events::with_capacity(capacity);
    tracing::debug!(capacity, ?timeout, "poller started");

    while shared.running.load(Ordering::SeqCst) {
        if let Err(err) = poll.poll(&mut events, Some(timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %err, "poll failed, poller exiting");
            break;
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            shared.dispatch(Readiness::from(event));
        }
        shared.fire_deadlines();
    }

    tracing::debug!("poller stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        net::TcpListener,
        sync::{atomic::AtomicUsize, mpsc},
    };

    use super::*;
    use crate::DEFAULT_EVENTS_CAPACITY;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_reactor_creation() {
        let reactor = Reactor::new(DEFAULT_EVENTS_CAPACITY, Duration::from_millis(50));
        assert!(reactor.is_ok());
        assert_eq!(reactor.unwrap().mode(), IoMode::EdgeTriggered);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Reactor::new(0, Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_readable_dispatch() {
        let reactor = Reactor::new(64, Duration::from_millis(20)).unwrap();
        let (mut client, server) = pair();
        server.set_nonblocking(true).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let descriptor = reactor
            .register(
                &server,
                Arc::new(move |ready: Readiness| {
                    let _ = tx.lock().unwrap().send(ready);
                }),
            )
            .unwrap();

        client.write_all(b"ping").unwrap();
        let ready = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ready.descriptor(), descriptor);
        assert!(ready.is_readable());
        assert_eq!(reactor.registered(), 1);

        reactor.stop(descriptor).unwrap();
        assert_eq!(reactor.registered(), 0);
    }

    #[test]
    fn test_deadline_fires_once() {
        let reactor = Reactor::new(64, Duration::from_millis(10)).unwrap();
        let (_client, server) = pair();
        server.set_nonblocking(true).unwrap();

        let timeouts = Arc::new(AtomicUsize::new(0));
        let counter = timeouts.clone();
        let descriptor = reactor
            .register(
                &server,
                Arc::new(move |ready: Readiness| {
                    if ready.is_timed_out() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        reactor.set_deadline(descriptor, Some(Instant::now() + Duration::from_millis(30)));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        reactor.stop(descriptor).unwrap();
    }

    #[test]
    fn test_stop_unknown_descriptor_is_ok() {
        let reactor = Reactor::new(8, Duration::from_millis(10)).unwrap();
        assert!(reactor.stop(Descriptor::new(999)).is_ok());
    }
}
