use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::consts::REGISTRY_SHARDS;

/// Provides a process-wide registry mapping in-flight request IDs to
/// per-request handler state.
///
/// The registry is partitioned so the receive/send/cancel hot paths can
/// look up handlers under contention without sharing one lock: IDs map to a
/// partition by `id % REGISTRY_SHARDS`, and each partition has its own
/// read-write lock. IDs come from a single monotonic counter and are never
/// reused within a process.
pub struct ShardedRegistry<T> {
    shards: [RwLock<HashMap<u64, T>>; REGISTRY_SHARDS],
    next_id: AtomicU64,
}

impl<T: Clone> ShardedRegistry<T> {
    pub fn new() -> Self {
        ShardedRegistry {
            shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers handler state and returns the request ID assigned to it.
    /// The entry must be inserted before the application callable is
    /// invoked so callbacks arriving from the interpreter always find it.
    pub fn register(&self, handle: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shard(id)
            .write()
            .expect("registry shard lock should not be poisoned")
            .insert(id, handle);
        id
    }

    pub fn lookup(&self, id: u64) -> Option<T> {
        self.shard(id)
            .read()
            .expect("registry shard lock should not be poisoned")
            .get(&id)
            .cloned()
    }

    /// Removes the entry for `id`. Called only after the request has
    /// completed or been cancelled.
    pub fn unregister(&self, id: u64) {
        self.shard(id)
            .write()
            .expect("registry shard lock should not be poisoned")
            .remove(&id);
    }

    fn shard(&self, id: u64) -> &RwLock<HashMap<u64, T>> {
        &self.shards[(id % REGISTRY_SHARDS as u64) as usize]
    }
}

impl<T: Clone> Default for ShardedRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_register_lookup_unregister_round_trip() {
        let registry = ShardedRegistry::new();
        let id = registry.register("handler-a");
        assert_eq!(registry.lookup(id), Some("handler-a"));

        registry.unregister(id);
        assert_eq!(registry.lookup(id), None);
    }

    #[test]
    fn test_ids_are_strictly_increasing_and_never_reused() {
        let registry = ShardedRegistry::new();
        let first = registry.register(1u8);
        registry.unregister(first);
        let second = registry.register(2u8);
        let third = registry.register(3u8);

        assert!(second > first);
        assert!(third > second);
        // Unregistering never returns an ID to the pool.
        assert_eq!(registry.lookup(first), None);
    }

    #[test]
    fn test_concurrent_registration_assigns_unique_ids() {
        let registry = Arc::new(ShardedRegistry::new());
        let mut tasks = vec![];
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(std::thread::spawn(move || {
                (0..100).map(|n| registry.register(n)).collect::<Vec<_>>()
            }));
        }

        let mut all_ids = vec![];
        for task in tasks {
            all_ids.extend(task.join().unwrap());
        }
        all_ids.sort_unstable();
        let before_dedup = all_ids.len();
        all_ids.dedup();
        assert_eq!(all_ids.len(), before_dedup);
    }
}
