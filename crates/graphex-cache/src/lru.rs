use std::hash::Hash;

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

/// A keyed map with strict least-recently-used eviction.
///
/// Map order doubles as recency order: the front holds the least recently
/// used entry, and every read or write moves the touched entry to the back.
/// Inserting a new key at capacity evicts the front entry.
///
/// [`get`](Self::get) counts as a use; [`peek`](Self::peek) does not. Emitted
/// cache snapshots are clones of this map, so lookups against a snapshot never
/// affect the recency of the live cache.
#[derive(Debug, Clone)]
pub struct LruMap<K, V> {
    entries: IndexMap<K, V, FxBuildHasher>,
    capacity: usize,
}

impl<K: Eq + Hash, V> LruMap<K, V> {
    /// Creates an empty map that holds at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LruMap capacity must be non-zero");
        Self {
            entries: IndexMap::with_capacity_and_hasher(capacity + 1, FxBuildHasher),
            capacity,
        }
    }

    /// Inserts an entry and marks it most recently used.
    ///
    /// Returns the previous value if the key was already present. If the
    /// insert grows the map beyond capacity, the least recently used entry is
    /// evicted.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let (index, previous) = self.entries.insert_full(key, value);
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        if previous.is_none() && self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
        previous
    }

    /// Looks up an entry and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = self.entries.get_index_of(key)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        self.entries.get(key)
    }

    /// Looks up an entry without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries in recency order, least recently used first.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_evicts_least_recently_used() {
        let mut map = LruMap::new(3);
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);

        // reading "a" protects it from the eviction triggered by "d"
        assert_eq!(map.get(&"a"), Some(&1));
        map.insert("d", 4);

        assert_eq!(map.len(), 3);
        assert!(!map.contains_key(&"b"));
        assert!(map.contains_key(&"a"));
        assert!(map.contains_key(&"c"));
        assert!(map.contains_key(&"d"));
    }

    #[test]
    fn test_replace_touches_recency() {
        let mut map = LruMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);

        assert_eq!(map.insert("a", 10), Some(1));
        map.insert("c", 3);

        assert!(!map.contains_key(&"b"));
        assert_eq!(map.peek(&"a"), Some(&10));
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut map = LruMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);

        assert_eq!(map.peek(&"a"), Some(&1));
        map.insert("c", 3);

        // "a" was only peeked, so it is still the eviction victim
        assert!(!map.contains_key(&"a"));
        assert!(map.contains_key(&"b"));
        assert!(map.contains_key(&"c"));
    }

    #[test]
    fn test_recency_order_iteration() {
        let mut map = LruMap::new(3);
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);
        map.get(&"b");

        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec!["a", "c", "b"]);
    }
}
