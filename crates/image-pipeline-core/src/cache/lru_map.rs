//! Ordered key map with byte accounting

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Map that keeps keys ordered by a caller-supplied stamp and tracks the
/// total byte size of its values.
///
/// The entry with the smallest stamp is the eviction candidate.
#[derive(Debug)]
pub(crate) struct CountingLruMap<K, V> {
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    size_in_bytes: usize,
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    stamp: u64,
    size: usize,
}

impl<K: Clone + Eq + Hash, V> CountingLruMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            size_in_bytes: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace, returning the displaced value
    pub fn put(&mut self, key: K, value: V, size: usize, stamp: u64) -> Option<V> {
        let old = self.remove(&key);
        self.order.insert(stamp, key.clone());
        self.size_in_bytes += size;
        self.entries.insert(key, Slot { value, stamp, size });
        old
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.stamp);
        self.size_in_bytes -= slot.size;
        Some(slot.value)
    }

    /// Move an existing key to the given stamp
    pub fn restamp(&mut self, key: &K, stamp: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(slot) => {
                self.order.remove(&slot.stamp);
                slot.stamp = stamp;
                self.order.insert(stamp, key.clone());
                true
            }
            None => false,
        }
    }

    /// Key with the oldest stamp
    pub fn first_key(&self) -> Option<&K> {
        self.order.values().next()
    }

    /// Keys matching the predicate, oldest first
    pub fn matching_keys(&self, predicate: impl Fn(&K) -> bool) -> Vec<K> {
        self.order
            .values()
            .filter(|key| predicate(key))
            .cloned()
            .collect()
    }

    /// Remove every entry whose key matches, returning the removed values
    pub fn remove_all(&mut self, predicate: impl Fn(&K) -> bool) -> Vec<(K, V)> {
        self.matching_keys(predicate)
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|value| (key, value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_size() {
        let mut map = CountingLruMap::new();
        map.put("a", 1, 10, 3);
        map.put("b", 2, 20, 1);
        map.put("c", 3, 30, 2);

        assert_eq!(map.count(), 3);
        assert_eq!(map.size_in_bytes(), 60);
        assert_eq!(map.first_key(), Some(&"b"));

        map.restamp(&"b", 9);
        assert_eq!(map.first_key(), Some(&"c"));

        assert_eq!(map.remove(&"c"), Some(3));
        assert_eq!(map.size_in_bytes(), 30);
        assert_eq!(map.first_key(), Some(&"a"));
    }

    #[test]
    fn test_put_replaces() {
        let mut map = CountingLruMap::new();
        map.put("a", 1, 10, 1);
        assert_eq!(map.put("a", 2, 5, 2), Some(1));
        assert_eq!(map.count(), 1);
        assert_eq!(map.size_in_bytes(), 5);
        assert_eq!(map.get(&"a"), Some(&2));
    }

    #[test]
    fn test_remove_all() {
        let mut map = CountingLruMap::new();
        for (i, key) in ["x1", "y1", "x2"].into_iter().enumerate() {
            map.put(key, i, 1, i as u64);
        }
        let removed = map.remove_all(|k| k.starts_with('x'));
        assert_eq!(removed, vec![("x1", 0), ("x2", 2)]);
        assert_eq!(map.count(), 1);
        assert!(map.contains(&"y1"));
        assert_eq!(map.remove_all(|_| true).len(), 1);
        assert_eq!(map.size_in_bytes(), 0);
    }
}
