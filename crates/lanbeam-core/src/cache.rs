//! Time-bounded key/value cache.
//!
//! Every protocol-level cache in Lanbeam (discovered peers, upload
//! sessions, v1 address bindings, share sessions) is a [`TtlCache`]:
//! a thread-safe map whose entries expire a fixed duration after their
//! last write. Expired entries are collected lazily on access and
//! eagerly by a low-frequency sweeper task.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A thread-safe map with per-entry absolute expiry.
///
/// `set` resets the entry's expiry to `now + ttl`; `get` never returns
/// an expired value. Iteration order is unspecified.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache whose entries live for `ttl` after each write.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert or refresh an entry, resetting its expiry to now + TTL.
    pub fn set(&self, key: K, value: V) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Fetch a live entry, removing it lazily if it has expired.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read().expect("cache lock poisoned");
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Entry exists but is expired: collect it.
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if entries
            .get(key)
            .is_some_and(|e| e.expires_at <= Instant::now())
        {
            entries.remove(key);
        }
        None
    }

    /// Refresh an entry's expiry without replacing its value.
    ///
    /// Returns `false` if the entry is missing or already expired.
    pub fn touch(&self, key: &K) -> bool {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.expires_at = Instant::now() + self.ttl;
                true
            }
            _ => false,
        }
    }

    /// Remove an entry, returning its value if it was still live.
    pub fn delete(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let entry = entries.remove(key)?;
        (entry.expires_at > Instant::now()).then_some(entry.value)
    }

    /// Visit every non-expired entry.
    ///
    /// The visitor runs over a snapshot, so concurrent mutation during
    /// iteration is safe.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V),
    {
        let snapshot: Vec<(K, V)> = {
            let entries = self.entries.read().expect("cache lock poisoned");
            let now = Instant::now();
            entries
                .iter()
                .filter(|(_, e)| e.expires_at > now)
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect()
        };
        for (k, v) in &snapshot {
            visit(k, v);
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let entries = self.entries.read().expect("cache lock poisoned");
        let now = Instant::now();
        entries.values().filter(|e| e.expires_at > now).count()
    }

    /// Whether the cache holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry now.
    ///
    /// Called by the sweeper; also usable directly in tests.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Spawn a background task sweeping this cache at `period`.
    ///
    /// The task runs until the returned handle is dropped via
    /// [`tokio::task::JoinHandle::abort`] or the runtime shuts down.
    pub fn spawn_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let dropped = cache.sweep();
                if dropped > 0 {
                    tracing::trace!("ttl sweep dropped {dropped} entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.set("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn test_expiry_is_lazy() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(10));
        cache.set("a", 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_resets_expiry() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(50));
        cache.set("a", 1);
        std::thread::sleep(Duration::from_millis(30));
        cache.set("a", 2);
        std::thread::sleep(Duration::from_millis(30));
        // First TTL window has passed, but the second write refreshed it.
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn test_touch_refreshes_without_replacing() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(50));
        cache.set("a", 7);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.touch(&"a"));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"a"), Some(7));
        assert!(!cache.touch(&"missing"));
    }

    #[test]
    fn test_delete_returns_live_value_only() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(10));
        cache.set("a", 1);
        assert_eq!(cache.delete(&"a"), Some(1));
        cache.set("b", 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.delete(&"b"), None);
    }

    #[test]
    fn test_range_skips_expired() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(30));
        cache.set("dead", 0);
        std::thread::sleep(Duration::from_millis(40));
        cache.set("live", 1);
        let mut seen = Vec::new();
        cache.range(|k, v| seen.push((*k, *v)));
        assert_eq!(seen, vec![("live", 1)]);
    }

    #[test]
    fn test_range_allows_concurrent_mutation() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60));
        for i in 0..10 {
            cache.set(i, i);
        }
        // Mutating from inside the visitor must not deadlock.
        cache.range(|k, _| {
            cache.delete(k);
        });
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_collects_eagerly() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_millis(10));
        for i in 0..5 {
            cache.set(i, i);
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.sweep(), 5);
    }
}
