//! Query cache actor.
//!
//! Results of expensive derived queries are kept in an LRU bounded to
//! `max_size`; entries older than `ttl` read as misses. The cache is not
//! told about graph merges: callers that know a write affects cached keys
//! invalidate them, everyone else accepts staleness up to `ttl`.

use cybernetic_config::CacheSection;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::key::{InvalidationPattern, QueryKey};

/// Error types for cache calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Query cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Query cache is unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Configuration for the query cache.
#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    /// Maximum number of entries.
    pub max_size: usize,
    /// Maximum age of an entry.
    pub ttl: Duration,
    /// How often expired entries are swept.
    pub sweep_interval: Duration,
    pub inbox_capacity: usize,
    pub call_timeout: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self::from(&CacheSection::default())
    }
}

impl From<&CacheSection> for QueryCacheConfig {
    fn from(section: &CacheSection) -> Self {
        Self {
            max_size: section.max_size,
            ttl: Duration::from_millis(section.ttl_ms),
            sweep_interval: Duration::from_millis(section.sweep_interval_ms.max(1)),
            inbox_capacity: section.inbox_capacity.max(1),
            call_timeout: Duration::from_millis(section.call_timeout_ms),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held and still fresh.
    pub active_entries: usize,
    /// Entries dropped for age so far, on read or by sweep.
    pub expired_entries: u64,
    pub max_size: usize,
    pub ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped to honor `max_size`.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    Hit(V),
    /// Absent or expired
    Miss,
}

impl<V> CacheLookup<V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_option(self) -> Option<V> {
        match self {
            CacheLookup::Hit(value) => Some(value),
            CacheLookup::Miss => None,
        }
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Cache contents and counters, owned by the cache task.
struct CacheState<V> {
    entries: LruCache<QueryKey, CacheEntry<V>>,
    max_size: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
    expired: u64,
    evictions: u64,
}

impl<V: Clone> CacheState<V> {
    fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_size: capacity.get(),
            ttl,
            hits: 0,
            misses: 0,
            expired: 0,
            evictions: 0,
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) > self.ttl
    }

    fn get(&mut self, key: &QueryKey) -> CacheLookup<V> {
        let now = Instant::now();
        let ttl = self.ttl;
        let lookup = match self.entries.get(key) {
            Some(entry) if now.duration_since(entry.inserted_at) > ttl => None,
            Some(entry) => Some(CacheLookup::Hit(entry.value.clone())),
            None => Some(CacheLookup::Miss),
        };

        match lookup {
            Some(CacheLookup::Hit(value)) => {
                self.hits += 1;
                CacheLookup::Hit(value)
            }
            Some(CacheLookup::Miss) => {
                self.misses += 1;
                CacheLookup::Miss
            }
            None => {
                self.entries.pop(key);
                self.expired += 1;
                self.misses += 1;
                CacheLookup::Miss
            }
        }
    }

    fn put(&mut self, key: QueryKey, value: V) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };
        if let Some((evicted, _)) = self.entries.push(key.clone(), entry) {
            if evicted != key {
                self.evictions += 1;
            }
        }
    }

    fn invalidate(&mut self, pattern: &InvalidationPattern) -> usize {
        if *pattern == InvalidationPattern::AllQueries {
            let removed = self.entries.len();
            self.entries.clear();
            return removed;
        }
        self.remove_where(|key, _| pattern.matches(key))
    }

    fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let removed = self.remove_where(|_, entry| now.duration_since(entry.inserted_at) > ttl);
        self.expired += removed as u64;
        removed
    }

    fn remove_where(&mut self, predicate: impl Fn(&QueryKey, &CacheEntry<V>) -> bool) -> usize {
        let doomed: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.entries.pop(key);
        }
        doomed.len()
    }

    fn stats(&self) -> CacheStats {
        let now = Instant::now();
        CacheStats {
            active_entries: self
                .entries
                .iter()
                .filter(|(_, entry)| !self.is_expired(entry, now))
                .count(),
            expired_entries: self.expired,
            max_size: self.max_size,
            ttl_ms: self.ttl.as_millis() as u64,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

enum CacheCommand<V> {
    Get {
        key: QueryKey,
        reply: oneshot::Sender<CacheLookup<V>>,
    },
    Put {
        key: QueryKey,
        value: V,
    },
    Invalidate {
        pattern: InvalidationPattern,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to a running query cache.
pub struct QueryCache<V> {
    tx: mpsc::Sender<CacheCommand<V>>,
    call_timeout: Duration,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<V: Clone + Send + 'static> QueryCache<V> {
    /// Spawn a cache task on the current runtime.
    pub fn spawn(config: QueryCacheConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.inbox_capacity);
        let state = CacheState::new(config.max_size, config.ttl);
        info!(
            "Starting query cache (max {} entries, ttl {:?})",
            state.max_size, config.ttl
        );
        tokio::spawn(run(state, rx, config.sweep_interval));
        Self {
            tx,
            call_timeout: config.call_timeout,
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> CacheCommand<V>) -> Result<T> {
        let (reply, response) = oneshot::channel();
        let request = async move {
            self.tx
                .send(command(reply))
                .await
                .map_err(|_| CacheError::Unavailable)?;
            response.await.map_err(|_| CacheError::Unavailable)
        };
        time::timeout(self.call_timeout, request)
            .await
            .map_err(|_| CacheError::Timeout(self.call_timeout))?
    }

    async fn cast(&self, command: CacheCommand<V>) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CacheError::Unavailable)
    }

    pub async fn get(&self, key: &QueryKey) -> Result<CacheLookup<V>> {
        let key = key.clone();
        self.call(|reply| CacheCommand::Get { key, reply }).await
    }

    /// Insert or overwrite without waiting for the cache to apply it.
    pub async fn put(&self, key: QueryKey, value: V) -> Result<()> {
        self.cast(CacheCommand::Put { key, value }).await
    }

    /// Drop matching entries and return how many were removed.
    pub async fn invalidate_pattern(&self, pattern: InvalidationPattern) -> Result<usize> {
        self.call(|reply| CacheCommand::Invalidate { pattern, reply })
            .await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.call(|reply| CacheCommand::Stats { reply }).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.call(|reply| CacheCommand::Clear { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.cast(CacheCommand::Shutdown).await
    }
}

async fn run<V: Clone>(
    mut state: CacheState<V>,
    mut inbox: mpsc::Receiver<CacheCommand<V>>,
    sweep_interval: Duration,
) {
    let mut sweep = time::interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = inbox.recv() => match command {
                Some(CacheCommand::Get { key, reply }) => {
                    let _ = reply.send(state.get(&key));
                }
                Some(CacheCommand::Put { key, value }) => state.put(key, value),
                Some(CacheCommand::Invalidate { pattern, reply }) => {
                    let removed = state.invalidate(&pattern);
                    debug!("Invalidated {} cache entries for {:?}", removed, pattern);
                    let _ = reply.send(removed);
                }
                Some(CacheCommand::Stats { reply }) => {
                    let _ = reply.send(state.stats());
                }
                Some(CacheCommand::Clear { reply }) => {
                    state.entries.clear();
                    let _ = reply.send(());
                }
                Some(CacheCommand::Shutdown) | None => break,
            },
            _ = sweep.tick() => {
                let removed = state.sweep();
                if removed > 0 {
                    debug!("Swept {} expired cache entries", removed);
                }
            }
        }
    }

    info!("Query cache stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_size: usize, ttl_ms: u64) -> QueryCacheConfig {
        QueryCacheConfig {
            max_size,
            ttl: Duration::from_millis(ttl_ms),
            sweep_interval: Duration::from_secs(3600),
            inbox_capacity: 64,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn key(name: &str) -> QueryKey {
        QueryKey::new(name)
    }

    #[tokio::test(start_paused = true)]
    async fn hit_before_ttl_and_miss_after() {
        let cache = QueryCache::spawn(config(10, 1_000));
        cache.put(key("q"), 42).await.unwrap();

        assert_eq!(cache.get(&key("q")).await.unwrap(), CacheLookup::Hit(42));

        time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(cache.get(&key("q")).await.unwrap(), CacheLookup::Miss);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.active_entries, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.ttl_ms, 1_000);
    }

    #[tokio::test]
    async fn overflow_keeps_most_recently_used() {
        let cache = QueryCache::spawn(config(3, 60_000));
        for name in ["a", "b", "c"] {
            cache.put(key(name), name.to_string()).await.unwrap();
        }
        // touch "a" so "b" is the least recently used
        assert!(cache.get(&key("a")).await.unwrap().is_hit());
        cache.put(key("d"), "d".to_string()).await.unwrap();
        cache.put(key("e"), "e".to_string()).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.active_entries, 3);
        assert_eq!(stats.evictions, 2);
        assert!(cache.get(&key("a")).await.unwrap().is_hit());
        assert!(cache.get(&key("d")).await.unwrap().is_hit());
        assert!(cache.get(&key("e")).await.unwrap().is_hit());
        assert_eq!(cache.get(&key("b")).await.unwrap(), CacheLookup::Miss);
    }

    #[tokio::test]
    async fn overwrite_is_not_an_eviction() {
        let cache = QueryCache::spawn(config(2, 60_000));
        cache.put(key("a"), 1).await.unwrap();
        cache.put(key("a"), 2).await.unwrap();
        assert_eq!(cache.get(&key("a")).await.unwrap(), CacheLookup::Hit(2));
        assert_eq!(cache.stats().await.unwrap().evictions, 0);
    }

    #[tokio::test]
    async fn invalidate_by_position_and_all() {
        let cache = QueryCache::spawn(config(10, 60_000));
        cache.put(key("q").subject("alice"), 1).await.unwrap();
        cache.put(key("q").subject("bob"), 2).await.unwrap();
        cache.put(key("q").predicate("likes"), 3).await.unwrap();
        cache.put(key("q").object("pizza"), 4).await.unwrap();

        let removed = cache
            .invalidate_pattern(InvalidationPattern::Subject("alice".into()))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(&key("q").subject("bob")).await.unwrap().is_hit());

        assert_eq!(
            cache
                .invalidate_pattern(InvalidationPattern::Object("pizza".into()))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            cache
                .invalidate_pattern(InvalidationPattern::AllQueries)
                .await
                .unwrap(),
            2
        );
        assert_eq!(cache.stats().await.unwrap().active_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_entries_never_read_again() {
        let cache = QueryCache::spawn(QueryCacheConfig {
            sweep_interval: Duration::from_millis(500),
            ..config(10, 1_000)
        });
        cache.put(key("a"), 1).await.unwrap();
        cache.put(key("b"), 2).await.unwrap();

        time::sleep(Duration::from_millis(2_100)).await;
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.expired_entries, 2);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let cache = QueryCache::spawn(config(10, 60_000));
        cache.put(key("a"), 1).await.unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.get(&key("a")).await.unwrap(), CacheLookup::Miss);
    }

    #[tokio::test]
    async fn shut_down_cache_is_unavailable() {
        let cache: QueryCache<u32> = QueryCache::spawn(config(10, 60_000));
        cache.shutdown().await.unwrap();
        let err = loop {
            match cache.stats().await {
                Err(err) => break err,
                Ok(_) => tokio::task::yield_now().await,
            }
        };
        assert_eq!(err, CacheError::Unavailable);
    }

    #[test]
    fn hit_ratio() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        assert_eq!(stats.hit_ratio(), 0.75);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}
