//! Content-addressed caching with generational collection
//!
//! A [`ContentAddressedCache`] maps a structural key to a lazily created
//! native object and stamps every entry with the frame it was last handed
//! out. [`ContentAddressedCache::gc`] runs at most once every
//! `release_frequency` calls and evicts entries idle for `time_to_keep`
//! frames. Lookups never evict.
//!
//! Keys carry a precomputed XXH3 hash ([`HashedKey`]) so that map probes and
//! equality checks reject mismatches on a single integer compare.

use crate::config::GcPolicy;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

/// Hash a value's structural fields with XXH3
pub fn structural_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = Xxh3::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// A key together with its precomputed structural hash
#[derive(Debug, Clone)]
pub struct HashedKey<K> {
    hash: u64,
    key: K,
}

impl<K: Hash> HashedKey<K> {
    /// Compute the hash of `key` and wrap it
    pub fn new(key: K) -> Self {
        Self {
            hash: structural_hash(&key),
            key,
        }
    }
}

impl<K> HashedKey<K> {
    /// Precomputed hash
    pub const fn hash_value(&self) -> u64 {
        self.hash
    }

    /// The wrapped key
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Unwrap the key
    pub fn into_key(self) -> K {
        self.key
    }
}

impl<K: PartialEq> PartialEq for HashedKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key == other.key
    }
}

impl<K: Eq> Eq for HashedKey<K> {}

impl<K> Hash for HashedKey<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Shared reference that compares and hashes by allocation identity
///
/// Used for key fields naming an object (a program, a surface) rather than
/// describing one. Holding the `Arc` keeps the object alive, so its address
/// cannot be reused while the key exists.
pub struct ByIdentity<T: ?Sized>(pub Arc<T>);

impl<T: ?Sized> ByIdentity<T> {
    /// Wrap a shared reference
    pub fn new(value: &Arc<T>) -> Self {
        Self(Arc::clone(value))
    }

    fn address(&self) -> *const () {
        Arc::as_ptr(&self.0).cast::<()>()
    }
}

impl<T: ?Sized> Clone for ByIdentity<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> PartialEq for ByIdentity<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl<T: ?Sized> Eq for ByIdentity<T> {}

impl<T: ?Sized> Hash for ByIdentity<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for ByIdentity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByIdentity({:p})", self.address())
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    frame_used: u64,
}

/// Counters describing cache activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries
    pub entries: usize,
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that created a value
    pub misses: u64,
    /// Entries destroyed by collection
    pub evictions: u64,
}

/// Structural-key cache with frame-stamped entries
#[derive(Debug)]
pub struct ContentAddressedCache<K, V> {
    entries: HashMap<HashedKey<K>, CacheEntry<V>>,
    policy: GcPolicy,
    current_frame: u64,
    last_gc_frame: u64,
    stats: CacheStats,
}

impl<K: Hash + Eq, V> ContentAddressedCache<K, V> {
    /// Create an empty cache
    pub fn new(policy: GcPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
            current_frame: 0,
            last_gc_frame: 0,
            stats: CacheStats::default(),
        }
    }

    /// Return the value for `key`, creating it on a miss
    ///
    /// Hits refresh the entry's last-used frame.
    pub fn get_or_create(&mut self, key: HashedKey<K>, create: impl FnOnce(&K) -> V) -> &mut V {
        let frame = self.current_frame;
        match self.entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(occupied) => {
                self.stats.hits += 1;
                let entry = occupied.into_mut();
                entry.frame_used = frame;
                &mut entry.value
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                self.stats.misses += 1;
                let value = create(vacant.key().key());
                &mut vacant.insert(CacheEntry { value, frame_used: frame }).value
            }
        }
    }

    /// Look up without creating; refreshes the entry on a hit
    pub fn get(&mut self, key: &HashedKey<K>) -> Option<&mut V> {
        let frame = self.current_frame;
        let entry = self.entries.get_mut(key)?;
        self.stats.hits += 1;
        entry.frame_used = frame;
        Some(&mut entry.value)
    }

    /// Look up without refreshing
    pub fn peek(&self, key: &HashedKey<K>) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Refresh an entry's last-used frame; returns false if absent
    pub fn touch(&mut self, key: &HashedKey<K>) -> bool {
        let frame = self.current_frame;
        self.entries.get_mut(key).map(|entry| entry.frame_used = frame).is_some()
    }

    /// Last frame an entry was used
    pub fn frame_used(&self, key: &HashedKey<K>) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.frame_used)
    }

    /// True if the key has a live entry
    pub fn contains(&self, key: &HashedKey<K>) -> bool {
        self.entries.contains_key(key)
    }

    /// Run a collection pass if one is due, then advance the frame
    ///
    /// `destroy` receives every evicted entry. Returns the eviction count.
    pub fn gc(&mut self, mut destroy: impl FnMut(K, V)) -> usize {
        let mut evicted = 0;

        if self.current_frame >= self.last_gc_frame + self.policy.release_frequency {
            self.last_gc_frame = self.current_frame;

            let current = self.current_frame;
            let keep = self.policy.time_to_keep;
            let entries = std::mem::take(&mut self.entries);
            self.entries.reserve(entries.len());

            for (key, entry) in entries {
                if entry.frame_used + keep <= current {
                    destroy(key.into_key(), entry.value);
                    evicted += 1;
                } else {
                    self.entries.insert(key, entry);
                }
            }

            self.stats.evictions += evicted as u64;
        }

        self.current_frame += 1;
        evicted
    }

    /// Remove every entry, e.g. at shutdown
    pub fn drain(&mut self, mut destroy: impl FnMut(K, V)) {
        for (key, entry) in self.entries.drain() {
            destroy(key.into_key(), entry.value);
        }
    }

    /// Iterate over live values
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|entry| &entry.value)
    }

    /// Mutably iterate over live values
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut().map(|entry| &mut entry.value)
    }

    /// Frame counter, advanced once per `gc` call
    pub const fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Frame of the last collection pass that ran
    pub const fn last_gc_frame(&self) -> u64 {
        self.last_gc_frame
    }

    /// Eviction policy
    pub const fn policy(&self) -> GcPolicy {
        self.policy
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Activity counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ContentAddressedCache<u32, String> {
        ContentAddressedCache::new(GcPolicy::new(2, 4))
    }

    #[test]
    fn test_hit_returns_same_value_without_creating() {
        let mut cache = cache();
        let mut created = 0;

        let first = cache
            .get_or_create(HashedKey::new(7), |k| {
                created += 1;
                format!("value-{k}")
            })
            .clone();
        let second = cache
            .get_or_create(HashedKey::new(7), |_| {
                created += 1;
                String::new()
            })
            .clone();

        assert_eq!(first, "value-7");
        assert_eq!(first, second);
        assert_eq!(created, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_gc_runs_only_at_release_frequency() {
        let mut cache = cache();
        cache.get_or_create(HashedKey::new(1), |_| "a".to_string());

        // frame 0: 0 < 0 + 2, skipped
        cache.gc(|_, _| {});
        assert_eq!(cache.last_gc_frame(), 0);
        // frame 1: skipped
        cache.gc(|_, _| {});
        // frame 2: runs
        cache.gc(|_, _| {});
        assert_eq!(cache.last_gc_frame(), 2);
        assert_eq!(cache.current_frame(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_timing() {
        let mut cache = cache();
        let key = || HashedKey::new(1u32);

        // Used on frames 0..=4
        for _ in 0..=4 {
            cache.get_or_create(key(), |_| "a".to_string());
            cache.gc(|_, _| {});
        }
        assert_eq!(cache.frame_used(&key()), Some(4));

        let mut evicted_at = None;
        for _ in 5..12 {
            let frame = cache.current_frame();
            let mut evicted = Vec::new();
            cache.gc(|k, _| evicted.push(k));
            if !evicted.is_empty() {
                evicted_at = Some(frame);
                break;
            }
            // Present through frame t + k - 1
            if frame <= 7 {
                assert!(cache.contains(&key()));
            }
        }

        assert_eq!(evicted_at, Some(8));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lookup_never_evicts() {
        let mut cache = cache();
        cache.get_or_create(HashedKey::new(3), |_| "x".to_string());
        for _ in 0..3 {
            cache.gc(|_, _| {});
        }
        // Stale by age but no gc has run since
        assert!(cache.get(&HashedKey::new(3)).is_some());
        assert!(cache.peek(&HashedKey::new(9)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_frame_used_is_monotonic() {
        let mut cache = cache();
        let key = HashedKey::new(5u32);
        cache.get_or_create(key.clone(), |_| String::new());
        let mut last = 0;
        for _ in 0..6 {
            cache.gc(|_, _| {});
            cache.touch(&key);
            let used = cache.frame_used(&key).unwrap();
            assert!(used >= last);
            last = used;
        }
    }

    #[test]
    fn test_by_identity_ignores_contents() {
        let a = Arc::new(10);
        let b = Arc::new(10);
        assert_eq!(ByIdentity::new(&a), ByIdentity::new(&a));
        assert_ne!(ByIdentity::new(&a), ByIdentity::new(&b));
        assert_eq!(
            structural_hash(&ByIdentity::new(&a)),
            structural_hash(&ByIdentity(Arc::clone(&a)))
        );
    }

    #[test]
    fn test_hashed_key_equality_checks_fields() {
        let a = HashedKey::new((1u32, "a"));
        let b = HashedKey::new((1u32, "a"));
        let c = HashedKey::new((2u32, "a"));
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_ne!(a, c);
    }

    #[test]
    fn test_drain_releases_everything() {
        let mut cache = cache();
        for i in 0..4 {
            cache.get_or_create(HashedKey::new(i), |_| String::new());
        }
        let mut released = 0;
        cache.drain(|_, _| released += 1);
        assert_eq!(released, 4);
        assert!(cache.is_empty());
    }
}
