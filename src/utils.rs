use std::time::{Duration, Instant};

use crate::thread_pool::DEFAULT_POOL_CAPACITY;

pub fn get_default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}

/// Deadline `timeout` from now, or `None` when no timeout is configured.
pub fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Time left until `deadline`, clamped to `slice`.
pub fn clamp_to_deadline(slice: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(at) => at
            .saturating_duration_since(Instant::now())
            .min(slice)
            .max(Duration::from_millis(1)),
        None => slice,
    }
}
