//! Storage provider contract and the default in-memory store.

use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use tokio::time::{Duration, Instant};

use super::{config::CacheConfig, entry::CacheEntry, lock::mutex_lock, ttl::Ttl};

const SOURCE: &str = "cache::provider::memory";
/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Failure reported by a [`CacheProvider`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("cache backend error: {message}")]
    Backend { message: String },
    #[error("cache backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("failed to decode cached entry for `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode cache entry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("cache provider panicked during {operation}")]
    Panicked { operation: &'static str },
}

impl ProviderError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Pluggable cache storage.
///
/// Implementations own their synchronization; the engine calls `get` and
/// `set` concurrently from many requests. Concurrent `set`s for one key may
/// race and the last write wins.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Look up an entry. `Ok(None)` is a plain miss.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, ProviderError>;

    /// Store or replace the entry for `key`, expiring according to `ttl`.
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Ttl) -> Result<(), ProviderError>;
}

struct StoredEntry {
    entry: CacheEntry,
    stale_until: Instant,
}

/// Bounded LRU store with per-entry TTL and stale window.
///
/// Entries are served until `max_age + stale_while_revalidate` has elapsed,
/// then dropped on the next access.
pub struct MemoryProvider {
    entries: Mutex<LruCache<String, StoredEntry>>,
}

impl MemoryProvider {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.max_items_non_zero())),
        }
    }

    pub fn with_capacity(max_items: usize) -> Self {
        Self::new(&CacheConfig {
            max_items,
            ..Default::default()
        })
    }

    pub fn invalidate(&self, key: &str) {
        mutex_lock(&self.entries, SOURCE, "invalidate").pop(key);
    }

    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }

    /// Number of stored entries, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheProvider for MemoryProvider {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, ProviderError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let now = Instant::now();

        let expired = match entries.get(key) {
            Some(stored) if now < stored.stale_until => return Ok(Some(stored.entry.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Ttl) -> Result<(), ProviderError> {
        let now = Instant::now();
        let stale_until = now
            .checked_add(Duration::from_secs(ttl.total_secs()))
            .unwrap_or(now + FAR_FUTURE);
        let evicted = mutex_lock(&self.entries, SOURCE, "set")
            .push(key.to_string(), StoredEntry { entry, stale_until });

        // `push` also hands back the previous value when `key` was replaced.
        if evicted.is_some_and(|(evicted_key, _)| evicted_key != key) {
            counter!("outcache_evict_total").increment(1);
        }
        Ok(())
    }
}
