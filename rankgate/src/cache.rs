// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memoisation of resolved permissions per holder and active context set.
//!
//! Every invalidation draws a new number from a global generation counter and stamps it on the
//! invalidated holder. A cached result remembers the generation it was computed at and the holders
//! it read, it is only served while none of those holders carry a newer stamp and none of the
//! temporary nodes involved expired. Invalidation additionally drops affected entries eagerly, and
//! both steps finish before `invalidate` returns, so a read issued after a mutation never observes a
//! result computed before it.
//!
//! Stamps older than every live entry carry no information and are folded into a floor generation,
//! which keeps their number bounded by the cache capacity.
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::calculator::ResolvedPermissions;
use crate::context::ContextSet;
use crate::holder::HolderId;
use crate::node::Timestamp;

/// Default upper bound for the number of cached resolutions.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Resolutions are computed per holder and normalised active context set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey<U> {
    pub holder: HolderId<U>,
    pub contexts: ContextSet,
}

impl<U> CacheKey<U> {
    pub fn new(holder: HolderId<U>, contexts: ContextSet) -> Self {
        Self { holder, contexts }
    }
}

/// Counters describing cache usage since creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct Entry<U> {
    resolved: Arc<ResolvedPermissions<U>>,
    computed_at: u64,
}

#[derive(Debug)]
struct Slot<U> {
    value: OnceLock<Entry<U>>,
    last_used: AtomicU64,
}

#[derive(Debug)]
pub struct ResolutionCache<U>
where
    U: Eq + Hash,
{
    entries: DashMap<CacheKey<U>, Arc<Slot<U>>>,
    stamps: DashMap<HolderId<U>, u64>,
    generation: AtomicU64,
    floor: AtomicU64,
    clock: AtomicU64,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl<U> ResolutionCache<U>
where
    U: Clone + Debug + Eq + Hash,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            stamps: DashMap::new(),
            generation: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the cached resolution for `key` or compute it.
    ///
    /// Concurrent callers asking for the same key while it is being computed wait for that single
    /// computation instead of running their own. A result which turns out to be stale (because a
    /// mutation raced the computation) is dropped and computed again.
    pub fn get_or_compute<F>(
        &self,
        key: &CacheKey<U>,
        now: Timestamp,
        compute: F,
    ) -> Arc<ResolvedPermissions<U>>
    where
        F: Fn() -> ResolvedPermissions<U>,
    {
        for _ in 0..2 {
            let slot = self.slot(key);
            slot.last_used
                .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);

            let mut computed = false;
            let entry = slot.value.get_or_init(|| {
                computed = true;
                let computed_at = self.generation.load(Ordering::SeqCst);
                Entry {
                    resolved: Arc::new(compute()),
                    computed_at,
                }
            });

            if self.is_valid(entry, now) {
                if computed {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    trace!(holder = ?key.holder, contexts = %key.contexts, "resolution cache miss");
                    self.evict_if_needed();
                } else {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                }
                return entry.resolved.clone();
            }

            trace!(holder = ?key.holder, "dropping stale resolution");
            self.entries
                .remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        }

        // Mutations keep racing the computation, answer without caching.
        self.misses.fetch_add(1, Ordering::Relaxed);
        Arc::new(compute())
    }

    /// Drop every result which depends on the given holder.
    ///
    /// This covers the holder's own entries and the entries of every holder inheriting from it,
    /// as their results list it as a dependency.
    pub fn invalidate(&self, holder: &HolderId<U>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stamps.insert(holder.clone(), generation);
        self.invalidations.fetch_add(1, Ordering::Relaxed);

        let before = self.entries.len();
        self.entries.retain(|_, slot| match slot.value.get() {
            Some(entry) => !entry.resolved.dependencies().contains(holder),
            None => true,
        });

        debug!(
            holder = ?holder,
            generation,
            dropped = before.saturating_sub(self.entries.len()),
            "invalidated cached resolutions"
        );

        self.compact_stamps();
    }

    /// Drop everything.
    pub fn invalidate_all(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.floor.fetch_max(generation, Ordering::SeqCst);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.entries.clear();
        debug!(generation, "invalidated all cached resolutions");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn slot(&self, key: &CacheKey<U>) -> Arc<Slot<U>> {
        if let Some(slot) = self.entries.get(key) {
            return slot.value().clone();
        }

        self.entries
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    value: OnceLock::new(),
                    last_used: AtomicU64::new(0),
                })
            })
            .value()
            .clone()
    }

    fn is_valid(&self, entry: &Entry<U>, now: Timestamp) -> bool {
        if entry.computed_at < self.floor.load(Ordering::SeqCst) {
            return false;
        }

        if entry
            .resolved
            .valid_until()
            .is_some_and(|until| until <= now)
        {
            return false;
        }

        entry.resolved.dependencies().iter().all(|holder| {
            self.stamps
                .get(holder)
                .is_none_or(|stamp| *stamp <= entry.computed_at)
        })
    }

    /// Fold stamps into the floor generation once there are more of them than the capacity.
    ///
    /// A stamp at or below the floor is redundant, every entry computed before it is rejected by the
    /// floor already. The floor is raised to the oldest live entry, or to the current generation when
    /// that still leaves too many stamps, dropping the entries below it.
    fn compact_stamps(&self) {
        if self.stamps.len() <= self.capacity {
            return;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let oldest = self
            .entries
            .iter()
            .filter_map(|item| item.value().value.get().map(|entry| entry.computed_at))
            .min();

        let mut floor = oldest.map_or(generation, |oldest| oldest.min(generation));
        let newer = self
            .stamps
            .iter()
            .filter(|stamp| *stamp.value() > floor)
            .count();
        if newer > self.capacity {
            floor = generation;
        }

        self.floor.fetch_max(floor, Ordering::SeqCst);
        let floor = self.floor.load(Ordering::SeqCst);
        self.stamps.retain(|_, stamp| *stamp > floor);
        self.entries.retain(|_, slot| {
            slot.value
                .get()
                .is_none_or(|entry| entry.computed_at >= floor)
        });

        debug!(floor, stamps = self.stamps.len(), "compacted invalidation stamps");
    }

    /// Evict least recently used entries once the cache grew past its capacity, down to 90% of it.
    fn evict_if_needed(&self) {
        if self.entries.len() <= self.capacity {
            return;
        }

        let target = self.capacity - self.capacity / 10;
        let mut candidates: Vec<(CacheKey<U>, u64)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().last_used.load(Ordering::Relaxed)))
            .collect();
        candidates.sort_by_key(|(_, last_used)| *last_used);

        let excess = candidates.len().saturating_sub(target);
        for (key, _) in candidates.into_iter().take(excess) {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<U> Default for ResolutionCache<U>
where
    U: Clone + Debug + Eq + Hash,
{
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    use crate::calculator::{ResolvedPermissions, Tristate, calculate};
    use crate::context::ContextSet;
    use crate::graph::GroupLookup;
    use crate::holder::{Group, HolderId, PermissionHolder, User};
    use crate::node::Node;

    use super::{CacheKey, ResolutionCache};

    struct NoGroups;

    impl GroupLookup for NoGroups {
        fn group(&self, _name: &str) -> Option<Arc<Group>> {
            None
        }
    }

    struct Groups(HashMap<String, Arc<Group>>);

    impl GroupLookup for Groups {
        fn group(&self, name: &str) -> Option<Arc<Group>> {
            self.0.get(name).cloned()
        }
    }

    fn resolve(user: &User<char>) -> ResolvedPermissions<char> {
        calculate(user, &ContextSet::new(), 0, &NoGroups, 16)
    }

    fn key(id: char) -> CacheKey<char> {
        CacheKey::new(HolderId::User(id), ContextSet::new())
    }

    #[test]
    fn hit_after_miss() {
        let cache = ResolutionCache::new(16);
        let user = User::new('a', "default").unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            cache.get_or_compute(&key('a'), 0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                resolve(&user)
            });
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn invalidation_is_visible_to_the_next_read() {
        let cache = ResolutionCache::new(16);
        let mut user = User::new('a', "default").unwrap();

        let resolved = cache.get_or_compute(&key('a'), 0, || resolve(&user));
        assert_eq!(resolved.check("fly"), Tristate::Undefined);

        user.nodes_mut().set(Node::new("fly", true).unwrap());
        cache.invalidate(&HolderId::User('a'));
        assert!(cache.is_empty());

        let resolved = cache.get_or_compute(&key('a'), 0, || resolve(&user));
        assert_eq!(resolved.check("fly"), Tristate::True);
    }

    #[test]
    fn invalidating_a_group_reaches_inheriting_users() {
        let cache = ResolutionCache::new(16);
        let user = User::new('a', "default").unwrap();
        let other = User::new('b', "other").unwrap();

        let mut groups = Groups(HashMap::new());
        groups.0.insert(
            "default".to_string(),
            Arc::new(Group::new("default").unwrap()),
        );

        cache.get_or_compute(&key('a'), 0, || {
            calculate(&user, &ContextSet::new(), 0, &groups, 16)
        });
        cache.get_or_compute(&key('b'), 0, || {
            calculate(&other, &ContextSet::new(), 0, &groups, 16)
        });
        assert_eq!(cache.len(), 2);

        cache.invalidate(&HolderId::Group("default".to_string()));
        assert_eq!(cache.len(), 1);

        // Also unknown groups are tracked, creating "other" later must invalidate 'b'.
        cache.invalidate(&HolderId::Group("other".to_string()));
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_results_computed_during_invalidation_are_not_served() {
        let cache = ResolutionCache::new(16);
        let user = User::new('a', "default").unwrap();

        // Simulate a mutation landing while the first computation is running.
        let raced = AtomicBool::new(false);
        let first = cache.get_or_compute(&key('a'), 0, || {
            if !raced.swap(true, Ordering::SeqCst) {
                cache.invalidate(&HolderId::User('a'));
            }
            resolve(&user)
        });
        assert_eq!(first.check("group.default"), Tristate::True);

        // The entry computed before the invalidation finished was rejected and recomputed, so the
        // cached one is newer than the invalidation.
        let calls = AtomicUsize::new(0);
        cache.get_or_compute(&key('a'), 0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            resolve(&user)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expiry_bounds_entries() {
        let cache = ResolutionCache::new(16);
        let mut user = User::new('a', "default").unwrap();
        user.nodes_mut()
            .set(Node::new("fly", true).unwrap().expires_at(10));

        let compute = |now| calculate(&user, &ContextSet::new(), now, &NoGroups, 16);

        let resolved = cache.get_or_compute(&key('a'), 5, || compute(5));
        assert_eq!(resolved.check("fly"), Tristate::True);

        let resolved = cache.get_or_compute(&key('a'), 10, || compute(10));
        assert_eq!(resolved.check("fly"), Tristate::Undefined);
    }

    #[test]
    fn invalidate_all() {
        let cache = ResolutionCache::new(16);
        let user = User::new('a', "default").unwrap();
        cache.get_or_compute(&key('a'), 0, || resolve(&user));
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ResolutionCache::new(10);
        let users: Vec<User<char>> = ('a'..='l')
            .map(|id| User::new(id, "default").unwrap())
            .collect();

        for user in &users {
            let id = user.user_id();
            cache.get_or_compute(&key(id), 0, || resolve(user));
            // Keep 'a' warm.
            cache.get_or_compute(&key('a'), 0, || resolve(&users[0]));
        }

        assert!(cache.len() <= 10);
        assert!(cache.stats().evictions > 0);

        let calls = AtomicUsize::new(0);
        cache.get_or_compute(&key('a'), 0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            resolve(&users[0])
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stamps_stay_bounded() {
        let cache = ResolutionCache::<u64>::new(16);
        for id in 0..10_000 {
            cache.invalidate(&HolderId::User(id));
        }

        assert!(cache.is_empty());
        assert!(cache.stamps.len() <= 16);
    }

    #[test]
    fn compaction_keeps_entries_newer_than_the_floor() {
        let cache = ResolutionCache::new(4);
        for id in ['b', 'c', 'd'] {
            cache.invalidate(&HolderId::User(id));
        }

        let user = User::new('a', "default").unwrap();
        cache.get_or_compute(&key('a'), 0, || resolve(&user));

        // Pushes the stamp count over the capacity.
        for id in ['e', 'f'] {
            cache.invalidate(&HolderId::User(id));
        }
        assert_eq!(cache.stamps.len(), 2);

        let calls = AtomicUsize::new(0);
        cache.get_or_compute(&key('a'), 0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            resolve(&user)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // An invalidation after compaction still reaches the entry.
        cache.invalidate(&HolderId::User('a'));
        let resolved = cache.get_or_compute(&key('a'), 0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            resolve(&user)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolved.check("group.default"), Tristate::True);
    }

    #[test]
    fn computes_once_under_contention() {
        let cache = Arc::new(ResolutionCache::new(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let user = User::new('a', "default").unwrap();
                    barrier.wait();
                    cache.get_or_compute(&key('a'), 0, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        resolve(&user)
                    })
                })
            })
            .collect();

        for handle in handles {
            let resolved = handle.join().unwrap();
            assert_eq!(resolved.check("group.default"), Tristate::True);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
