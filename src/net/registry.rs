use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use lockfree::map::Map as LockfreeMap;

use super::Connection;

/// Live connections of one engine, keyed by id.
///
/// ```text
///   LockfreeMap<u64, Arc<Connection>>
///        ├──> 1 ──> Connection { tcp, server, .. }
///        ├──> 2 ──> Connection { tls, client, .. }
///        └──> N ──> ...
/// ```
///
/// Ids are handed out monotonically and never reused. The live counter is
/// kept beside the map so it can be read without walking it.
pub struct Registry {
    connections: LockfreeMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
    live: AtomicUsize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: LockfreeMap::new(),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, conn: Arc<Connection>) {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(conn.id(), conn);
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.val()))
    }

    /// Ids of every registered connection, ascending.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live-connection counter.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let registry = Registry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(b > a);
        assert!(registry.is_empty());
        assert_eq!(registry.live(), 0);
    }
}
