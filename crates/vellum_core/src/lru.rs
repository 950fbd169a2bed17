//! A small bounded map with least-recently-used eviction.

use std::collections::HashMap;
use std::hash::Hash;

struct Entry<V> {
    value: V,
    stamp: u64,
}

/// A bounded map evicting least-recently-used entries.
///
/// This replaces garbage-collector-driven (soft/weak reference) caches
/// with an explicit policy whose eviction is observable and can be
/// forced deterministically by tests: capacity is exact, access order is
/// tracked per read, and an optional eviction check can veto evicting
/// entries that are still in use elsewhere (the analogue of a weak
/// reference staying alive while referenced).
///
/// When every over-capacity entry is vetoed the map is allowed to grow;
/// it re-trims as soon as entries become evictable again.
pub struct LruMap<K, V> {
    capacity: usize,
    next_stamp: u64,
    entries: HashMap<K, Entry<V>>,
    evictable: Option<fn(&V) -> bool>,
}

impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
    /// Creates a map bounded to `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_stamp: 0,
            entries: HashMap::new(),
            evictable: None,
        }
    }

    /// Creates a bounded map whose eviction is vetoed for entries where
    /// `evictable` returns false.
    #[must_use]
    pub fn with_evict_check(capacity: usize, evictable: fn(&V) -> bool) -> Self {
        Self {
            capacity,
            next_stamp: 0,
            entries: HashMap::new(),
            evictable: Some(evictable),
        }
    }

    /// The configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a key is present, without touching access order.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Reads an entry and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.bump();
        let entry = self.entries.get_mut(key)?;
        entry.stamp = stamp;
        Some(&entry.value)
    }

    /// Mutably reads an entry and marks it most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let stamp = self.bump();
        let entry = self.entries.get_mut(key)?;
        entry.stamp = stamp;
        Some(&mut entry.value)
    }

    /// Reads an entry without touching access order.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Inserts an entry as most recently used, trimming to capacity.
    pub fn insert(&mut self, key: K, value: V) {
        let stamp = self.bump();
        self.entries.insert(key, Entry { value, stamp });
        self.trim();
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates over entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, e)| (k, &e.value))
    }

    fn bump(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| match self.evictable {
                    Some(check) => check(&e.value),
                    None => true,
                })
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl<K: Eq + Hash + Clone, V> std::fmt::Debug for LruMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
