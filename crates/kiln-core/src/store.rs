use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::hash::ContentFingerprint;
use crate::key::{CacheKey, CacheKind};

/// A cached value plus its bookkeeping.
///
/// Entries live inside an [`ArtifactCache`]; callers only ever see clones.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    /// Wall-clock insertion time, for reporting.
    pub cached_at: DateTime<Utc>,
    pub fingerprint: ContentFingerprint,
    pub access_count: u64,
    inserted: Instant,
    last_accessed: Instant,
    access_seq: u64,
}

impl<T> CacheEntry<T> {
    pub fn age(&self) -> Duration {
        self.inserted.elapsed()
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub fn idle(&self) -> Duration {
        self.last_accessed.elapsed()
    }

    /// Sort key for LRU ordering. The sequence number breaks ties between
    /// accesses that share an `Instant`.
    pub fn recency(&self) -> (Instant, u64) {
        (self.last_accessed, self.access_seq)
    }
}

/// Why a stored entry was rejected on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    Expired,
    FingerprintMismatch,
    ArtifactMissing,
}

/// Outcome of a validated read.
#[derive(Debug)]
pub enum Lookup<T> {
    Hit(CacheEntry<T>),
    Miss,
    Stale(Invalidation),
}

impl<T> Lookup<T> {
    pub fn into_hit(self) -> Option<CacheEntry<T>> {
        match self {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Miss | Lookup::Stale(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Point-in-time statistics of one cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub kind: CacheKind,
    pub entries: usize,
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// TTL-bounded, access-tracked store keyed by [`CacheKey`].
///
/// Reads and writes are atomic per key. There is no cross-key transaction:
/// scans over [`entries`](Self::entries) see a snapshot that concurrent writers
/// may already have moved past.
pub struct ArtifactCache<T> {
    kind: CacheKind,
    max_age: Duration,
    entries: RwLock<HashMap<CacheKey, CacheEntry<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    access_seq: AtomicU64,
}

impl<T: Clone + Send + Sync> ArtifactCache<T> {
    pub fn new(kind: CacheKind, max_age: Duration) -> Self {
        Self {
            kind,
            max_age,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            access_seq: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or overwrite. Access tracking restarts at one access, now.
    pub async fn put(&self, key: CacheKey, value: T, fingerprint: ContentFingerprint) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            cached_at: Utc::now(),
            fingerprint,
            access_count: 1,
            inserted: now,
            last_accessed: now,
            access_seq: self.next_seq(),
        };
        let mut entries = self.entries.write().await;
        entries.insert(key, entry);
    }

    /// Read without touching counters or access tracking.
    pub async fn peek(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let entries = self.entries.read().await;
        entries.get(key).cloned()
    }

    /// Validated read.
    ///
    /// The entry must be younger than `max_age` and pass `check`. A rejected
    /// entry is removed and counted as both a miss and an eviction.
    pub async fn get_if<F>(&self, key: &CacheKey, check: F) -> Lookup<T>
    where
        F: FnOnce(&CacheEntry<T>) -> Result<(), Invalidation>,
    {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };

        let verdict = if entry.age() >= self.max_age {
            Err(Invalidation::Expired)
        } else {
            check(entry)
        };

        match verdict {
            Ok(()) => {
                entry.access_count += 1;
                entry.last_accessed = Instant::now();
                entry.access_seq = self.access_seq.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Hit(entry.clone())
            }
            Err(reason) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = %self.kind, key = %key, ?reason, "Evicted stale entry");
                Lookup::Stale(reason)
            }
        }
    }

    /// Read checking only the age and the stored fingerprint.
    pub async fn get(&self, key: &CacheKey, current: &ContentFingerprint) -> Lookup<T> {
        self.get_if(key, |entry| {
            if &entry.fingerprint == current {
                Ok(())
            } else {
                Err(Invalidation::FingerprintMismatch)
            }
        })
        .await
    }

    /// Explicit removal. Not counted as an eviction.
    pub async fn remove(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let mut entries = self.entries.write().await;
        entries.remove(key)
    }

    /// Removal under cache pressure. Returns whether the key was present.
    pub async fn evict(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(key).is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry older than `max_age`. Returns the removed keys.
    pub async fn sweep_expired(&self) -> Vec<CacheKey> {
        let mut entries = self.entries.write().await;
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.age() >= self.max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        if !expired.is_empty() {
            self.evictions.fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::debug!(cache = %self.kind, removed = expired.len(), "Expired entries swept");
        }
        expired
    }

    /// Drop all entries and reset the counters.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub async fn entries(&self) -> Vec<(CacheKey, CacheEntry<T>)> {
        let entries = self.entries.read().await;
        entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Statistics snapshot; `size_of` measures each value at call time.
    pub async fn stats_with<F>(&self, size_of: F) -> CacheStats
    where
        F: Fn(&T) -> u64,
    {
        let entries = self.entries.read().await;
        let counters = self.counters();
        let lookups = counters.hits + counters.misses;
        CacheStats {
            kind: self.kind,
            entries: entries.len(),
            size_bytes: entries.values().map(|e| size_of(&e.value)).sum(),
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                counters.hits as f64 / lookups as f64
            },
            oldest_entry: entries.values().map(|e| e.cached_at).min(),
            newest_entry: entries.values().map(|e| e.cached_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHasher;

    fn cache(max_age: Duration) -> ArtifactCache<String> {
        ArtifactCache::new(CacheKind::Script, max_age)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::script::<&str>(name, &[])
    }

    #[tokio::test]
    async fn put_then_get_is_a_hit() {
        let cache = cache(Duration::from_secs(60));
        let fp = ContentHasher::fingerprint_str("echo hi");
        cache.put(key("hello"), "echo hi".into(), fp.clone()).await;

        let entry = cache.get(&key("hello"), &fp).await.into_hit().unwrap();
        assert_eq!(entry.value, "echo hi");
        assert_eq!(entry.access_count, 2);
        assert_eq!(cache.counters().hits, 1);
    }

    #[tokio::test]
    async fn missing_key_counts_a_miss_only() {
        let cache = cache(Duration::from_secs(60));
        let fp = ContentHasher::fingerprint_str("x");
        assert!(matches!(cache.get(&key("nope"), &fp).await, Lookup::Miss));
        assert_eq!(
            cache.counters(),
            CacheCounters {
                hits: 0,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[tokio::test]
    async fn fingerprint_mismatch_evicts_exactly_once() {
        let cache = cache(Duration::from_secs(60));
        let old = ContentHasher::fingerprint_str("echo hi");
        let new = ContentHasher::fingerprint_str("echo ho");
        cache.put(key("hello"), "echo hi".into(), old).await;

        let lookup = cache.get(&key("hello"), &new).await;
        assert!(matches!(lookup, Lookup::Stale(Invalidation::FingerprintMismatch)));
        assert_eq!(cache.counters().evictions, 1);
        assert!(cache.is_empty().await);

        // the slot is gone: a second read is a plain miss
        assert!(matches!(cache.get(&key("hello"), &new).await, Lookup::Miss));
        assert_eq!(cache.counters().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_max_age() {
        let cache = cache(Duration::from_secs(1));
        let fp = ContentHasher::fingerprint_str("echo hi");
        cache.put(key("hello"), "echo hi".into(), fp.clone()).await;

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cache.get(&key("hello"), &fp).await.into_hit().is_some());

        tokio::time::advance(Duration::from_millis(600)).await;
        let lookup = cache.get(&key("hello"), &fp).await;
        assert!(matches!(lookup, Lookup::Stale(Invalidation::Expired)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let cache = cache(Duration::from_secs(10));
        let fp = ContentHasher::fingerprint_str("a");
        cache.put(key("old"), "a".into(), fp.clone()).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put(key("young"), "a".into(), fp.clone()).await;
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.sweep_expired().await, vec![key("old")]);
        assert!(cache.peek(&key("old")).await.is_none());
        assert!(cache.peek(&key("young")).await.is_some());
        assert_eq!(cache.counters().evictions, 1);
    }

    #[tokio::test]
    async fn custom_check_can_reject() {
        let cache = cache(Duration::from_secs(60));
        let fp = ContentHasher::fingerprint_str("lib");
        cache.put(key("lib"), "lib".into(), fp).await;

        let lookup = cache
            .get_if(&key("lib"), |_| Err(Invalidation::ArtifactMissing))
            .await;
        assert!(matches!(lookup, Lookup::Stale(Invalidation::ArtifactMissing)));
    }

    #[tokio::test]
    async fn put_overwrites_and_resets_access_tracking() {
        let cache = cache(Duration::from_secs(60));
        let fp = ContentHasher::fingerprint_str("v1");
        cache.put(key("s"), "v1".into(), fp.clone()).await;
        cache.get(&key("s"), &fp).await;
        cache.get(&key("s"), &fp).await;
        assert_eq!(cache.peek(&key("s")).await.unwrap().access_count, 3);

        let fp2 = ContentHasher::fingerprint_str("v2");
        cache.put(key("s"), "v2".into(), fp2).await;
        let entry = cache.peek(&key("s")).await.unwrap();
        assert_eq!(entry.value, "v2");
        assert_eq!(entry.access_count, 1);
    }

    #[tokio::test]
    async fn clear_resets_counters() {
        let cache = cache(Duration::from_secs(60));
        let fp = ContentHasher::fingerprint_str("a");
        cache.put(key("a"), "a".into(), fp.clone()).await;
        cache.get(&key("a"), &fp).await;
        cache.get(&key("b"), &fp).await;
        assert!(cache.evict(&key("a")).await);

        cache.clear().await;
        assert_eq!(cache.counters(), CacheCounters::default());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn stats_measure_sizes_and_ratio() {
        let cache = cache(Duration::from_secs(60));
        let fp = ContentHasher::fingerprint_str("abc");
        cache.put(key("a"), "abc".into(), fp.clone()).await;
        cache.put(key("b"), "de".into(), fp.clone()).await;
        cache.get(&key("a"), &fp).await;
        cache.get(&key("zzz"), &fp).await;

        let stats = cache.stats_with(|v| v.len() as u64).await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.size_bytes, 5);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert!(stats.oldest_entry.is_some());
    }
}
