use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, Builder, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;
/// Upper bound on core plus surge threads.
pub const DEFAULT_MAX_THREADS: usize = 1024;
/// How long a surge thread waits for work before it exits.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Counters {
    /// Threads parked in `recv`, or just woken and not yet busy.
    idle: AtomicUsize,
    /// Tasks sent and not yet taken.
    queued: AtomicUsize,
    live: AtomicUsize,
    spawned: AtomicUsize,
}

/// Executor threads that drain connection workers.
///
/// Every thread takes tasks from one shared queue, so a task never waits
/// behind a busy thread while another one is idle. When more tasks are
/// queued than there are idle threads, a surge thread is started; surge
/// threads exit after [`DEFAULT_KEEP_ALIVE`] without work. A task that
/// panics is caught so its thread survives for the next task.
pub struct ThreadPool {
    sender: Option<Sender<Task>>,
    receiver: Receiver<Task>,
    counters: Arc<Counters>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    max_threads: usize,
    keep_alive: Duration,
}

impl Default for ThreadPool {
    fn default() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut pool = ThreadPool {
            sender: Some(sender),
            receiver,
            counters: Arc::default(),
            handles: Mutex::new(Vec::new()),
            max_threads: DEFAULT_MAX_THREADS,
            keep_alive: DEFAULT_KEEP_ALIVE,
        };
        for _ in 0..crate::utils::get_default_capacity() {
            if pool.spawn(true).is_err() {
                break;
            }
        }
        if pool.threads_len() == 0 {
            // nothing can run; exec reports the executor as gone
            pool.sender = None;
        }
        pool
    }
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_limits(capacity, DEFAULT_MAX_THREADS, DEFAULT_KEEP_ALIVE)
    }

    /// `capacity` threads live for the whole pool; up to `max_threads` in
    /// total run while every core thread is busy.
    pub fn with_limits(capacity: usize, max_threads: usize, keep_alive: Duration) -> Result<Self> {
        let capacity = capacity.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pool = Self {
            sender: Some(sender),
            receiver,
            counters: Arc::default(),
            handles: Mutex::new(Vec::with_capacity(capacity)),
            max_threads: max_threads.max(capacity),
            keep_alive,
        };
        for _ in 0..capacity {
            pool.spawn(true)?;
        }
        Ok(pool)
    }

    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(Error::EventLoopGone)?;
        sender
            .send(Box::new(task))
            .map_err(|_| Error::EventLoopGone)?;

        let queued = self.counters.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if queued > self.counters.idle.load(Ordering::SeqCst)
            && self.counters.live.load(Ordering::SeqCst) < self.max_threads
        {
            if let Err(err) = self.spawn(false) {
                tracing::warn!(error = %err, "surge thread not started");
            }
        }
        Ok(())
    }

    /// Threads currently alive, core and surge.
    pub fn threads_len(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    fn spawn(&self, core: bool) -> Result<()> {
        let id = self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        let receiver = self.receiver.clone();
        let counters = Arc::clone(&self.counters);
        let keep_alive = (!core).then_some(self.keep_alive);

        counters.live.fetch_add(1, Ordering::SeqCst);
        let spawned = Builder::new()
            .name(format!("thread-pool-worker-{id}"))
            .spawn(move || run_thread(id, receiver, counters, keep_alive));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.counters.live.fetch_sub(1, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        let mut handles = lock(&self.handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }
}

fn run_thread(
    id: usize,
    receiver: Receiver<Task>,
    counters: Arc<Counters>,
    keep_alive: Option<Duration>,
) {
    loop {
        counters.idle.fetch_add(1, Ordering::SeqCst);
        let received = match keep_alive {
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(wait) => receiver.recv_timeout(wait),
        };

        let task = match received {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => {
                counters.idle.fetch_sub(1, Ordering::SeqCst);
                // a task sent while we timed out may have counted on us
                if receiver.is_empty() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                counters.idle.fetch_sub(1, Ordering::SeqCst);
                break;
            }
        };
        counters.idle.fetch_sub(1, Ordering::SeqCst);
        counters.queued.fetch_sub(1, Ordering::SeqCst);

        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
            tracing::error!(thread = id, "pool task panicked");
        }
    }
    counters.live.fetch_sub(1, Ordering::SeqCst);
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // disconnects the queue; threads finish what is queued, then exit
        self.sender.take();
        let current = thread::current().id();
        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            // the last handle may be released from inside a task
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
