use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

struct Entry<V> {
    value: V,
    stored_at: f64,
}

/// LRU cache with an optional time-to-live on top of capacity eviction.
///
/// Timestamps are fractional unix seconds, passed in by the caller so the
/// event loop controls the clock. Expired entries are dropped lazily on
/// lookup and eagerly by `sweep`.
pub struct TtlLru<K: Hash + Eq, V> {
    cache: LruCache<K, Entry<V>>,
    ttl: Option<f64>,
}

impl<K: Hash + Eq, V> TtlLru<K, V> {
    pub fn new(capacity: usize, ttl: Option<f64>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: LruCache::new(capacity),
            ttl,
        }
    }

    fn expired(&self, entry: &Entry<V>, now: f64) -> bool {
        match self.ttl {
            Some(ttl) => now - entry.stored_at > ttl,
            None => false,
        }
    }

    pub fn get_mut(&mut self, key: &K, now: f64) -> Option<&mut V> {
        let stale = match self.cache.peek(key) {
            Some(entry) => self.expired(entry, now),
            None => return None,
        };
        if stale {
            self.cache.pop(key);
            return None;
        }
        self.cache.get_mut(key).map(|entry| &mut entry.value)
    }

    pub fn put(&mut self, key: K, value: V, now: f64) {
        self.cache.put(
            key,
            Entry {
                value,
                stored_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Removes expired entries from the cold end to keep memory bounded
    /// between lookups.
    pub fn sweep(&mut self, now: f64) {
        let Some(ttl) = self.ttl else { return };
        loop {
            let stale = match self.cache.peek_lru() {
                Some((_, entry)) => now - entry.stored_at > ttl,
                None => false,
            };
            if !stale {
                break;
            }
            self.cache.pop_lru();
        }
    }

    /// Iterates live entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.cache.iter().map(|(key, entry)| (key, &entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache: TtlLru<u32, u32> = TtlLru::new(2, None);
        cache.put(1, 10, 0.0);
        cache.put(2, 20, 0.0);
        cache.put(3, 30, 0.0);

        assert!(cache.get_mut(&1, 0.0).is_none());
        assert_eq!(cache.get_mut(&2, 0.0), Some(&mut 20));
        assert_eq!(cache.get_mut(&3, 0.0), Some(&mut 30));
    }

    #[test]
    fn ttl_expires_entries_on_lookup() {
        let mut cache: TtlLru<u32, u32> = TtlLru::new(8, Some(10.0));
        cache.put(1, 10, 100.0);

        assert_eq!(cache.get_mut(&1, 105.0), Some(&mut 10));
        assert!(cache.get_mut(&1, 111.0).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_drops_stale_tail() {
        let mut cache: TtlLru<u32, u32> = TtlLru::new(8, Some(10.0));
        cache.put(1, 10, 0.0);
        cache.put(2, 20, 8.0);

        cache.sweep(11.0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_mut(&2, 11.0), Some(&mut 20));
    }
}
