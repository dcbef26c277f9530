use std::{
    ops::{Deref, DerefMut},
    sync::{mpsc as channel, Arc, Mutex},
};

pub const DEFAULT_BUFFER_LENGTH: usize = 65536;
pub const DEFAULT_MAX_BUFFERS: usize = 10_000;

/// A bounded free-list of fixed-length byte buffers reused across reads.
///
/// `get` never blocks: it hands out a queued buffer when one is available and
/// allocates a fresh one otherwise. `put` only takes back buffers whose
/// capacity equals the pool length, and silently drops them once the pool
/// holds `max_buffers` entries.
#[derive(Clone)]
pub struct BytePool {
    sender: channel::SyncSender<Vec<u8>>,
    receiver: Arc<Mutex<channel::Receiver<Vec<u8>>>>,
    length: usize,
}

impl BytePool {
    pub fn new(max_buffers: usize, length: usize) -> Self {
        let max_buffers = if max_buffers == 0 { 1024 } else { max_buffers };
        let length = if length == 0 { 128 } else { length };
        let (sender, receiver) = channel::sync_channel(max_buffers);

        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            length,
        }
    }

    /// Length of every buffer handed out by this pool.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn get(&self) -> Vec<u8> {
        let pooled = match self.receiver.lock() {
            Ok(receiver) => receiver.try_recv().ok(),
            Err(poisoned) => poisoned.into_inner().try_recv().ok(),
        };

        match pooled {
            Some(mut buf) => {
                // callers may have truncated it; capacity already matches
                buf.resize(self.length, 0);
                buf
            }
            None => vec![0; self.length],
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() != self.length {
            tracing::trace!(
                capacity = buf.capacity(),
                length = self.length,
                "dropping mismatched buffer"
            );
            return;
        }
        // full pool: discard
        let _ = self.sender.try_send(buf);
    }

    /// Gets a buffer that returns itself to the pool when dropped.
    pub fn acquire(&self) -> PooledBuffer {
        PooledBuffer {
            buf: Some(self.get()),
            pool: self.clone(),
        }
    }

    /// Approximate number of buffers currently queued.
    pub fn available(&self) -> usize {
        let receiver = match self.receiver.lock() {
            Ok(receiver) => receiver,
            Err(poisoned) => poisoned.into_inner(),
        };
        let drained: Vec<Vec<u8>> = receiver.try_iter().collect();
        let count = drained.len();
        drop(receiver);
        for buf in drained {
            let _ = self.sender.try_send(buf);
        }
        count
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS, DEFAULT_BUFFER_LENGTH)
    }
}

/// Buffer borrowed from a [`BytePool`]; handed back on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: BytePool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
