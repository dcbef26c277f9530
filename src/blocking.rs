//! Portable multiplexer: one watcher thread per socket.
//!
//! Each watcher blocks in `peek` on a duplicate of the socket handle, so no
//! data is consumed before the read task runs. After dispatching a readiness
//! the watcher waits for [`Multiplexer::rearm`]; the read task performs one
//! ordinary blocking read in between. Handler-visible behaviour matches the
//! readiness poller, only with one thread per connection.

use std::{
    collections::HashMap,
    io,
    net::TcpStream,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, RwLock,
    },
    thread::Builder,
    time::{Duration, Instant},
};

use crate::{
    error::Result,
    event::Readiness,
    poll::{Descriptor, IoMode, Multiplexer, ReadyFn},
    utils::clamp_to_deadline,
};

/// Longest single `peek` wait; bounds how late a stop or deadline is seen.
pub const DEFAULT_WATCH_SLICE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct WatchState {
    armed: bool,
    stopped: bool,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct Watch {
    state: Mutex<WatchState>,
    cond: Condvar,
}

impl Watch {
    fn lock(&self) -> MutexGuard<'_, WatchState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct BlockingPoller {
    watches: RwLock<HashMap<Descriptor, Arc<Watch>>>,
    next_descriptor: AtomicU64,
    slice: Duration,
}

impl Default for BlockingPoller {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_SLICE)
    }
}

impl BlockingPoller {
    pub fn new(slice: Duration) -> Self {
        Self {
            watches: RwLock::new(HashMap::new()),
            next_descriptor: AtomicU64::new(1),
            slice: slice.max(Duration::from_millis(1)),
        }
    }

    fn watch(&self, descriptor: Descriptor) -> Option<Arc<Watch>> {
        let watches = match self.watches.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watches.get(&descriptor).cloned()
    }
}

impl Multiplexer for BlockingPoller {
    fn register(&self, stream: &TcpStream, on_ready: ReadyFn) -> Result<Descriptor> {
        let descriptor = Descriptor::new(self.next_descriptor.fetch_add(1, Ordering::Relaxed));
        let stream = stream.try_clone()?;
        let watch = Arc::new(Watch::default());
        watch.lock().armed = true;

        let thread_watch = Arc::clone(&watch);
        let slice = self.slice;
        Builder::new()
            .name(format!("mill-conn-watch-{}", descriptor.as_u64()))
            .spawn(move || watch_loop(stream, descriptor, thread_watch, on_ready, slice))?;

        let mut watches = match self.watches.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watches.insert(descriptor, watch);
        Ok(descriptor)
    }

    fn stop(&self, descriptor: Descriptor) -> Result<()> {
        let removed = {
            let mut watches = match self.watches.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            watches.remove(&descriptor)
        };
        if let Some(watch) = removed {
            watch.lock().stopped = true;
            watch.cond.notify_all();
        }
        Ok(())
    }

    fn set_deadline(&self, descriptor: Descriptor, deadline: Option<Instant>) {
        if let Some(watch) = self.watch(descriptor) {
            watch.lock().deadline = deadline;
        }
    }

    fn rearm(&self, descriptor: Descriptor) {
        if let Some(watch) = self.watch(descriptor) {
            watch.lock().armed = true;
            watch.cond.notify_all();
        }
    }

    fn mode(&self) -> IoMode {
        IoMode::Blocking
    }
}

fn watch_loop(
    stream: TcpStream,
    descriptor: Descriptor,
    watch: Arc<Watch>,
    on_ready: ReadyFn,
    slice: Duration,
) {
    let mut peeked = [0u8; 1];

    loop {
        let deadline = {
            let mut state = watch.lock();
            while !state.armed && !state.stopped {
                state = match watch.cond.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            if state.stopped {
                break;
            }
            state.deadline
        };

        if let Err(err) = stream.set_read_timeout(Some(clamp_to_deadline(slice, deadline))) {
            tracing::debug!(descriptor = descriptor.as_u64(), error = %err, "watch timeout not set");
        }

        let readiness = match stream.peek(&mut peeked) {
            Ok(0) => Some(Readiness::hang_up(descriptor)),
            Ok(_) => Some(Readiness::readable(descriptor)),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => None,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                let mut state = watch.lock();
                match state.deadline {
                    Some(at) if at <= Instant::now() => {
                        state.deadline = None;
                        Some(Readiness::timed_out(descriptor))
                    }
                    _ => None,
                }
            }
            // the read task surfaces the socket error itself
            Err(_) => Some(Readiness::hang_up(descriptor)),
        };

        let Some(readiness) = readiness else {
            continue;
        };
        {
            let mut state = watch.lock();
            if state.stopped {
                break;
            }
            state.armed = false;
        }
        on_ready(readiness);
        if readiness.is_hang_up() {
            break;
        }
    }

    tracing::trace!(descriptor = descriptor.as_u64(), "watcher exited");
}
