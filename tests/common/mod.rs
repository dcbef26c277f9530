#![allow(dead_code)]

use std::{
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use mill_conn::{
    message::{FrameBuffer, Message},
    net::{Connection, Listener, StopHandle},
    poll::PollerKind,
    EventLoop, Handler,
};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connect(u64),
    Data(u64, Vec<u8>),
    Framed(u64, Message),
    Close(u64, String),
}

#[derive(Default)]
struct Log {
    seen: Mutex<Vec<Seen>>,
    changed: Condvar,
}

impl Log {
    fn push(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
        self.changed.notify_all();
    }
}

/// Handler that records every callback. With `framed` set, each TCP/TLS
/// connection gets a frame buffer on connect and decoded messages are
/// recorded instead of raw data.
#[derive(Default)]
pub struct Recorder {
    log: Arc<Log>,
    framed: bool,
    echo: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn framed() -> Arc<Self> {
        Arc::new(Self {
            framed: true,
            ..Self::default()
        })
    }

    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Self::default()
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.log.seen.lock().unwrap().clone()
    }

    /// Waits until `check` holds on the recorded callbacks.
    pub fn wait_until<F>(&self, check: F) -> bool
    where
        F: Fn(&[Seen]) -> bool,
    {
        let deadline = Instant::now() + WAIT;
        let mut seen = self.log.seen.lock().unwrap();
        while !check(&seen) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            seen = self.log.changed.wait_timeout(seen, left).unwrap().0;
        }
        true
    }

    pub fn closes(&self) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Close(_, reason) => Some(reason),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.seen()
            .iter()
            .filter(|s| matches!(s, Seen::Connect(_)))
            .count()
    }

    pub fn data(&self) -> Vec<u8> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Data(_, data) => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Framed(_, m) => Some(m),
                _ => None,
            })
            .collect()
    }
}

impl Handler for Recorder {
    fn on_connect(&self, conn: &Arc<Connection>) {
        self.log.push(Seen::Connect(conn.id()));
        if self.framed {
            let log = Arc::clone(&self.log);
            let id = conn.id();
            let buffer = FrameBuffer::new()
                .validate_id(true)
                .on_message(move |m| log.push(Seen::Framed(id, m)));
            conn.set_buffer(buffer).unwrap();
        }
    }

    fn on_message(&self, conn: &Arc<Connection>, data: &[u8]) {
        self.log.push(Seen::Data(conn.id(), data.to_vec()));
        if self.echo {
            let _ = conn.write(data);
        }
    }

    fn on_close(&self, conn: &Arc<Connection>, reason: &str) {
        self.log.push(Seen::Close(conn.id(), reason.to_string()));
    }
}

pub fn engine() -> Arc<EventLoop> {
    EventLoop::builder()
        .workers(2)
        .poll_timeout(Duration::from_millis(20))
        .worker_grace(Duration::from_millis(200))
        .build()
        .unwrap()
}

pub fn blocking_engine() -> Arc<EventLoop> {
    EventLoop::builder()
        .workers(2)
        .poller(PollerKind::Blocking)
        .poll_timeout(Duration::from_millis(20))
        .worker_grace(Duration::from_millis(200))
        .build()
        .unwrap()
}

/// Runs `listener` on a background thread.
pub fn serve(listener: Listener) -> (StopHandle, JoinHandle<()>) {
    let stop = listener.stop_handle();
    let handle = thread::spawn(move || {
        listener.run().unwrap();
    });
    (stop, handle)
}

pub fn frame(id: u64, kind: u8, body: &[u8]) -> Vec<u8> {
    let mut message = Message::new(kind, body.to_vec());
    message.id = id;
    message.marshal().to_vec()
}
