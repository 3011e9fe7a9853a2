//! TTL caches keyed by virtual-absolute path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires: Instant,
}

/// A simple expiring map. Values are cloned out; expired entries are
/// evicted lazily on access.
pub struct TtlCache<V> {
    ttl: Duration,
    map: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut map = self.map.lock().unwrap();
        match map.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut map = self.map.lock().unwrap();
        map.insert(
            key.into(),
            Entry {
                value,
                expires: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.map.lock().unwrap().remove(key);
    }

    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_insert_invalidate() {
        let cache = TtlCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("/a"), None);
        cache.insert("/a", 7u32);
        assert_eq!(cache.get("/a"), Some(7));
        cache.invalidate("/a");
        assert_eq!(cache.get("/a"), None);
    }

    #[test]
    fn entries_expire() {
        let cache = TtlCache::new(Duration::from_millis(0));
        cache.insert("/a", 1u32);
        assert_eq!(cache.get("/a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn negative_values_are_first_class() {
        let cache: TtlCache<Result<u32, i32>> = TtlCache::new(Duration::from_secs(60));
        cache.insert("/missing", Err(libc::ENOENT));
        assert_eq!(cache.get("/missing"), Some(Err(libc::ENOENT)));
    }
}
