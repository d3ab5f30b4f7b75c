use moka::sync::Cache;
use std::hash::Hash;
use std::time::Duration;

/// Concurrent cache whose entries expire after a fixed TTL.
///
/// Size is capped at `capacity`; once full, the least useful entries are
/// evicted. Expired entries are swept by moka's housekeeping, not only on read.
pub struct TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<K, V>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        let inner = Cache::builder().max_capacity(capacity).time_to_live(ttl).build();
        Self { inner, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    pub fn remove(&self, key: &K) {
        self.inner.invalidate(key);
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Live entry count, after pending evictions have run.
    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
