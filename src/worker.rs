//! Per-connection serialized task queue.
//!
//! Every readiness event of one connection becomes a task on that
//! connection's [`Worker`]. The worker hands a single drain job to the shared
//! [`ThreadPool`]; the drain job runs queued tasks one at a time in
//! submission order, so a handler never sees two concurrent callbacks for the
//! same connection while unrelated connections drain on other pool threads.
//!
//! ```text
//!   run(task) ──▶ [ queue (bounded) ] ──▶ drain job on ThreadPool
//!                                            │ one task at a time
//!                                            ▼
//!   close() ──▶ stop accepting ──▶ drain until empty or grace expires
//! ```

use std::{
    cell::Cell,
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use crate::thread_pool::{Task, ThreadPool};

pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Tasks run per drain job before it yields its pool thread.
const DRAIN_BATCH: usize = 64;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DRAINING: Cell<u64> = const { Cell::new(0) };
}

struct WorkerState {
    queue: VecDeque<Task>,
    scheduled: bool,
    closing_since: Option<Instant>,
}

struct WorkerInner {
    id: u64,
    state: Mutex<WorkerState>,
    space: Condvar,
    idle: Condvar,
    capacity: usize,
    grace: Duration,
    pool: Arc<ThreadPool>,
}

/// FIFO task queue bound to one connection.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self::with_limits(pool, DEFAULT_QUEUE_CAPACITY, DEFAULT_CLOSE_GRACE)
    }

    pub fn with_limits(pool: Arc<ThreadPool>, capacity: usize, grace: Duration) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(WorkerState {
                    queue: VecDeque::with_capacity(capacity.max(1)),
                    scheduled: false,
                    closing_since: None,
                }),
                space: Condvar::new(),
                idle: Condvar::new(),
                capacity: capacity.max(1),
                grace,
                pool,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Queues `task` behind every task submitted before it.
    ///
    /// Blocks while the queue is full, except when called from this worker's
    /// own drain. Returns `false` when the task was dropped because the
    /// worker is closed or its executor is gone; the caller is never told why.
    pub fn run<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        let on_own_drain = DRAINING.with(|d| d.get()) == inner.id;

        loop {
            if state.closing_since.is_some() {
                tracing::trace!(worker = inner.id, "task dropped after close");
                return false;
            }
            if on_own_drain || state.queue.len() < inner.capacity {
                break;
            }
            state = match inner.space.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        state.queue.push_back(Box::new(task));
        if state.scheduled {
            return true;
        }
        state.scheduled = true;
        drop(state);

        let drain_inner = Arc::clone(inner);
        if inner.pool.exec(move || drain(drain_inner)).is_err() {
            let mut state = inner.lock_state();
            state.scheduled = false;
            state.queue.clear();
            inner.idle.notify_all();
            tracing::warn!(worker = inner.id, "executor gone, worker queue discarded");
            return false;
        }
        true
    }

    /// Stops accepting tasks. Already queued tasks keep draining until the
    /// queue empties or the close grace period expires, whichever is first.
    /// Idempotent and never blocks.
    pub fn close(&self) {
        let mut state = self.inner.lock_state();
        if state.closing_since.is_none() {
            state.closing_since = Some(Instant::now());
            tracing::debug!(
                worker = self.inner.id,
                pending = state.queue.len(),
                "worker closing"
            );
        }
        drop(state);
        self.inner.space.notify_all();
    }

    /// Closes the worker and waits up to the grace period for its queue to
    /// drain. Returns `true` when the queue drained in time. Called from the
    /// worker's own drain it only closes, since waiting would deadlock.
    pub fn close_and_wait(&self) -> bool {
        self.close();
        if DRAINING.with(|d| d.get()) == self.inner.id {
            return false;
        }

        let deadline = Instant::now() + self.inner.grace;
        let mut state = self.inner.lock_state();
        while state.scheduled || !state.queue.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            state = match self.inner.idle.wait_timeout(state, left) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closing_since.is_some()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.lock_state().queue.len()
    }
}

impl WorkerInner {
    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn drain(inner: Arc<WorkerInner>) {
    let previous = DRAINING.with(|d| d.replace(inner.id));
    let mut ran = 0usize;

    loop {
        let task = {
            let mut state = inner.lock_state();
            if let Some(since) = state.closing_since {
                if since.elapsed() >= inner.grace && !state.queue.is_empty() {
                    tracing::debug!(
                        worker = inner.id,
                        discarded = state.queue.len(),
                        "close grace expired"
                    );
                    state.queue.clear();
                }
            }

            if ran >= DRAIN_BATCH && !state.queue.is_empty() {
                drop(state);
                let next = Arc::clone(&inner);
                if inner.pool.exec(move || drain(next)).is_ok() {
                    break;
                }
                ran = 0;
                continue;
            }

            match state.queue.pop_front() {
                Some(task) => task,
                None => {
                    state.scheduled = false;
                    drop(state);
                    inner.idle.notify_all();
                    break;
                }
            }
        };
        inner.space.notify_one();

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!(worker = inner.id, "worker task panicked");
        }
        ran += 1;
    }

    DRAINING.with(|d| d.set(previous));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;

    fn pool() -> Arc<ThreadPool> {
        Arc::new(ThreadPool::new(4).unwrap())
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let worker = Worker::new(pool());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..200 {
            let seen = seen.clone();
            assert!(worker.run(move || seen.lock().unwrap().push(i)));
        }

        assert!(worker.close_and_wait());
        assert_eq!(*seen.lock().unwrap(), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_submitters_never_overlap() {
        let worker = Worker::new(pool());
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let worker = worker.clone();
                let busy = busy.clone();
                let overlaps = overlaps.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let busy = busy.clone();
                        let overlaps = overlaps.clone();
                        let done = done.clone();
                        worker.run(move || {
                            if busy.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            std::thread::yield_now();
                            busy.store(false, Ordering::SeqCst);
                            done.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }

        assert!(worker.close_and_wait());
        assert_eq!(done.load(Ordering::SeqCst), 200);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_after_close_is_dropped() {
        let worker = Worker::new(pool());
        worker.close();
        worker.close();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        assert!(!worker.run(move || flag.store(true, Ordering::SeqCst)));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(worker.is_closed());
    }

    #[test]
    fn test_close_drains_queued_tasks() {
        let worker = Worker::new(pool());
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = count.clone();
            worker.run(move || {
                std::thread::sleep(Duration::from_millis(5));
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.close();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_grace_expiry_discards_backlog() {
        let worker = Worker::with_limits(pool(), 16, Duration::from_millis(20));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            worker.run(move || {
                std::thread::sleep(Duration::from_millis(40));
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.close();

        std::thread::sleep(Duration::from_millis(300));
        assert!(count.load(Ordering::SeqCst) < 5);
        assert_eq!(worker.pending(), 0);
    }

    #[test]
    fn test_task_may_enqueue_on_its_own_worker() {
        let worker = Worker::with_limits(pool(), 1, DEFAULT_CLOSE_GRACE);
        let count = Arc::new(AtomicUsize::new(0));

        let inner_worker = worker.clone();
        let inner_count = count.clone();
        worker.run(move || {
            for _ in 0..3 {
                let c = inner_count.clone();
                inner_worker.run(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(worker.close_and_wait());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocked_worker_does_not_delay_unrelated_workers() {
        let pool = Arc::new(ThreadPool::new(2).unwrap());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let slow = Worker::new(pool.clone());
        slow.run(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(3));
        });
        std::thread::sleep(Duration::from_millis(20));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let others: Vec<_> = (0..4).map(|_| Worker::new(pool.clone())).collect();
        for (i, worker) in others.iter().enumerate() {
            let done_tx = done_tx.clone();
            worker.run(move || {
                let _ = done_tx.send(i);
            });
        }
        drop(done_tx);

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut finished = Vec::new();
        while let Ok(i) = done_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            finished.push(i);
        }
        finished.sort_unstable();
        assert_eq!(finished, vec![0, 1, 2, 3]);

        drop(release_tx);
        assert!(slow.close_and_wait());
    }

    #[test]
    fn test_panicking_task_does_not_stop_worker() {
        let worker = Worker::new(pool());
        let count = Arc::new(AtomicUsize::new(0));

        worker.run(|| panic!("handler bug"));
        let c = count.clone();
        worker.run(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(worker.close_and_wait());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
