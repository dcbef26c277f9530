//! # Mill-Conn
//! A connection engine for TCP, UDP and TLS endpoints built on [`mio`], without an async runtime.
//!
//! One shared readiness poller watches every stream socket. Readiness is turned into read tasks
//! that run on a per-connection [`Worker`], so callbacks for one connection never overlap while
//! unrelated connections proceed in parallel on a small fixed thread pool. Reads land in pooled
//! buffers, pass through an optional encryption [`Method`](encrypt::Method), and are handed to
//! the application either raw or reassembled into framed [`Message`](message::Message)s.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ Server /    │───▶│  Connection  │───▶│ Multiplexer │  Reactor (mio) or BlockingPoller
//! │ Client      │    └──────────────┘    └─────────────┘
//! └─────────────┘            ▲                  │ readiness
//!                            │                  ▼
//!                    ┌──────────────┐    ┌─────────────┐
//!                    │  ThreadPool  │◀───│   Worker    │  one per connection, FIFO
//!                    └──────────────┘    └─────────────┘
//!                            │
//!                            ▼
//!              decrypt ──▶ FrameBuffer ──▶ Handler
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mill_conn::prelude::*;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, conn: &Arc<Connection>, data: &[u8]) {
//!         let _ = conn.write(data);
//!     }
//! }
//!
//! fn main() -> mill_conn::error::Result<()> {
//!     let options = Options::builder().build()?;
//!     let server = Server::new("127.0.0.1:9000", Echo, options)?;
//!     server.run_tcp()
//! }
//! ```
//!
//! Engines other than the process-wide one are built explicitly:
//!
//! ```rust,no_run
//! use mill_conn::EventLoop;
//!
//! let engine = EventLoop::new(
//!     4,      // executor threads
//!     1024,   // events per poll
//!     100     // poll timeout in ms
//! )?;
//! # Ok::<(), mill_conn::error::Error>(())
//! ```
//!
//! - [`EventLoop`]: bundles the multiplexer, executor, byte pool and connection registry
//! - [`net`]: servers, clients, connections and their options
//! - [`message`]: the 14-byte header wire format and the reassembly buffer
//! - [`encrypt`]: pluggable encryption methods
//! - [`worker`]: per-connection serialized task queue

pub mod blocking;
pub mod encrypt;
pub mod error;
pub mod event;
pub mod handler;
pub mod message;
pub mod net;
pub mod object_pool;
pub mod poll;
#[cfg(unix)]
pub mod reactor;
pub mod thread_pool;
pub mod utils;
pub mod worker;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

pub use handler::{Handler, NoopHandler};
pub use object_pool::{BytePool, PooledBuffer};
pub use worker::Worker;

use crate::{
    blocking::BlockingPoller,
    error::{Error, Result},
    net::Registry,
    object_pool::{DEFAULT_BUFFER_LENGTH, DEFAULT_MAX_BUFFERS},
    poll::{Multiplexer, PollerKind},
    thread_pool::ThreadPool,
    worker::{DEFAULT_CLOSE_GRACE, DEFAULT_QUEUE_CAPACITY},
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_conn::prelude::*;
/// ```
pub mod prelude {
    pub use crate::encrypt::{Method, MethodCode, MethodRegistry};
    pub use crate::handler::{Handler, NoopHandler};
    pub use crate::message::{FrameBuffer, Header, Message};
    pub use crate::net::{Client, Connection, Options, Role, Server, TransportKind};
    pub use crate::poll::PollerKind;
    pub use crate::EventLoop;
}

static SHARED: Mutex<Option<Arc<EventLoop>>> = Mutex::new(None);

/// The engine every connection runs on.
///
/// Owns one [`Multiplexer`], the executor threads that drain workers, the
/// [`BytePool`] used for reads and the [`Registry`] of live connections.
/// Servers and clients use [`EventLoop::shared`] unless handed another
/// engine; independent engines are useful for tests and embedding.
pub struct EventLoop {
    multiplexer: Arc<dyn Multiplexer>,
    executor: Arc<ThreadPool>,
    byte_pool: BytePool,
    registry: Arc<Registry>,
    worker_capacity: usize,
    worker_grace: Duration,
}

impl EventLoop {
    /// The process-wide engine, created with default settings on first use.
    pub fn shared() -> Result<Arc<EventLoop>> {
        let mut shared = SHARED.lock()?;
        if let Some(engine) = shared.as_ref() {
            return Ok(Arc::clone(engine));
        }
        let engine = Self::builder().build()?;
        tracing::debug!(
            workers = engine.executor.threads_len(),
            "shared event loop started"
        );
        *shared = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Creates an engine with a readiness poller and the given tuning.
    ///
    /// ## Arguments
    /// * `workers` - Number of executor threads
    /// * `events_capacity` - Maximum number of events per poll iteration
    /// * `poll_timeout_ms` - Poll timeout; also the granularity of read deadlines
    pub fn new(workers: usize, events_capacity: usize, poll_timeout_ms: u64) -> Result<Arc<Self>> {
        Self::builder()
            .workers(workers)
            .events_capacity(events_capacity)
            .poll_timeout(Duration::from_millis(poll_timeout_ms))
            .build()
    }

    pub fn builder() -> EventLoopBuilder {
        EventLoopBuilder::default()
    }

    pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.multiplexer
    }

    pub fn executor(&self) -> &Arc<ThreadPool> {
        &self.executor
    }

    pub fn byte_pool(&self) -> &BytePool {
        &self.byte_pool
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// A fresh worker draining on this engine's executor.
    pub fn new_worker(&self) -> Worker {
        Worker::with_limits(
            Arc::clone(&self.executor),
            self.worker_capacity,
            self.worker_grace,
        )
    }
}

/// Tuning for an [`EventLoop`]. Unset values take the crate defaults.
pub struct EventLoopBuilder {
    workers: usize,
    events_capacity: usize,
    poll_timeout: Duration,
    poller: PollerKind,
    buffer_length: usize,
    max_buffers: usize,
    worker_queue_capacity: usize,
    worker_grace: Duration,
}

impl Default for EventLoopBuilder {
    fn default() -> Self {
        Self {
            workers: utils::get_default_capacity(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            poller: PollerKind::default(),
            buffer_length: DEFAULT_BUFFER_LENGTH,
            max_buffers: DEFAULT_MAX_BUFFERS,
            worker_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl EventLoopBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn poller(mut self, kind: PollerKind) -> Self {
        self.poller = kind;
        self
    }

    /// Length of every pooled read buffer.
    pub fn buffer_length(mut self, length: usize) -> Self {
        self.buffer_length = length;
        self
    }

    pub fn max_buffers(mut self, max: usize) -> Self {
        self.max_buffers = max;
        self
    }

    pub fn worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    /// How long a closed worker keeps draining queued tasks.
    pub fn worker_grace(mut self, grace: Duration) -> Self {
        self.worker_grace = grace;
        self
    }

    pub fn build(self) -> Result<Arc<EventLoop>> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        if self.buffer_length == 0 || self.max_buffers == 0 {
            return Err(Error::Config("byte pool sizes must be positive".into()));
        }
        if self.worker_queue_capacity == 0 {
            return Err(Error::Config("worker queue capacity must be positive".into()));
        }

        let multiplexer = self.multiplexer()?;
        let executor = Arc::new(ThreadPool::new(self.workers)?);

        Ok(Arc::new(EventLoop {
            multiplexer,
            executor,
            byte_pool: BytePool::new(self.max_buffers, self.buffer_length),
            registry: Arc::new(Registry::new()),
            worker_capacity: self.worker_queue_capacity,
            worker_grace: self.worker_grace,
        }))
    }

    #[cfg(unix)]
    fn multiplexer(&self) -> Result<Arc<dyn Multiplexer>> {
        Ok(match self.poller {
            PollerKind::Readiness => Arc::new(reactor::Reactor::new(
                self.events_capacity,
                self.poll_timeout,
            )?),
            PollerKind::Blocking => Arc::new(BlockingPoller::new(self.poll_timeout)),
        })
    }

    #[cfg(not(unix))]
    fn multiplexer(&self) -> Result<Arc<dyn Multiplexer>> {
        if self.poller == PollerKind::Readiness {
            tracing::debug!("readiness polling unavailable, using blocking watchers");
        }
        Ok(Arc::new(BlockingPoller::new(self.poll_timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::IoMode;

    #[test]
    fn test_builder_defaults() {
        let engine = EventLoop::builder().workers(2).build().unwrap();
        assert_eq!(engine.executor().threads_len(), 2);
        assert_eq!(engine.byte_pool().length(), DEFAULT_BUFFER_LENGTH);
        assert!(engine.registry().is_empty());
        #[cfg(unix)]
        assert_eq!(engine.multiplexer().mode(), IoMode::EdgeTriggered);
    }

    #[test]
    fn test_blocking_poller_kind() {
        let engine = EventLoop::builder()
            .workers(1)
            .poller(PollerKind::Blocking)
            .build()
            .unwrap();
        assert_eq!(engine.multiplexer().mode(), IoMode::Blocking);
    }

    #[test]
    fn test_invalid_tuning() {
        assert!(matches!(
            EventLoop::builder().workers(0).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            EventLoop::builder().worker_queue_capacity(0).build(),
            Err(Error::Config(_))
        ));
        assert!(EventLoop::new(1, 0, 10).is_err());
    }

    #[test]
    fn test_shared_is_reused() {
        let a = EventLoop::shared().unwrap();
        let b = EventLoop::shared().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_new_worker_runs_on_executor() {
        let engine = EventLoop::new(1, 64, 10).unwrap();
        let worker = engine.new_worker();
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(worker.run(move || tx.send(7).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        assert!(worker.close_and_wait());
    }
}
