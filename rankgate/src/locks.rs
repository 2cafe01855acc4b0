// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-holder mutation locks.
//!
//! Changes to the same user, group or track are serialised while unrelated ones proceed in parallel.
//! Reads never take these locks, they work on immutable snapshots.
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry handing out one async mutex per key.
#[derive(Debug)]
pub struct LockRegistry<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> LockRegistry<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to the given key. Access is released when the guard is dropped.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        // The shard guard of the map is gone at this point, waiting here never blocks other keys.
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits for.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

impl<K> Default for LockRegistry<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::LockRegistry;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_exclusive() {
        let registry = Arc::new(LockRegistry::<&'static str>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = registry.lock(&"alice").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let registry = LockRegistry::new();
        let _alice = registry.lock(&"alice").await;
        let _bob = registry.lock(&"bob").await;
        assert_eq!(registry.locks.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let registry = LockRegistry::new();
        let guard = registry.lock(&"alice").await;
        drop(registry.lock(&"bob").await);

        registry.prune();
        assert_eq!(registry.locks.len(), 1);

        drop(guard);
        registry.prune();
        assert!(registry.locks.is_empty());
    }
}
