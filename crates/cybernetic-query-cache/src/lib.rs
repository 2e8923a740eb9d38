//! Local LRU + TTL cache for derived graph query results.
//!
//! Each node runs its own [`QueryCache`]; nothing here is replicated. Entries
//! are keyed by [`QueryKey`] and dropped when they age past the TTL, when the
//! cache overflows its size bound, or when a caller invalidates them with an
//! [`InvalidationPattern`].
//!
//! ```ignore
//! use cybernetic_query_cache::{QueryCache, QueryCacheConfig, QueryKey};
//!
//! let cache = QueryCache::spawn(QueryCacheConfig::default());
//! let key = QueryKey::new("friends_of").subject("alice");
//! cache.put(key.clone(), vec!["bob".to_string()]).await?;
//! assert!(cache.get(&key).await?.is_hit());
//! ```

pub mod cache;
pub mod key;

pub use cache::{CacheError, CacheLookup, CacheStats, QueryCache, QueryCacheConfig, Result};
pub use key::{InvalidationPattern, QueryKey};
