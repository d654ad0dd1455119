//! Adapter for string key-value backends (Redis, Memcached and the like).
//!
//! The backend only needs to store strings with an expiry; entries are
//! encoded as JSON.

use async_trait::async_trait;

use super::{
    entry::CacheEntry,
    provider::{CacheProvider, ProviderError},
    ttl::Ttl,
};

/// Minimal string store with per-key expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, ProviderError>;

    /// Store `value`, expiring after `expire_secs` seconds.
    async fn set_raw(&self, key: &str, value: String, expire_secs: u64)
    -> Result<(), ProviderError>;
}

/// [`CacheProvider`] over any [`KeyValueStore`].
pub struct JsonProvider<S> {
    store: S,
}

impl<S> JsonProvider<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: KeyValueStore> CacheProvider for JsonProvider<S> {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, ProviderError> {
        let Some(raw) = self.store.get_raw(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ProviderError::Decode {
                key: key.to_string(),
                source,
            })
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Ttl) -> Result<(), ProviderError> {
        let raw = serde_json::to_string(&entry).map_err(ProviderError::Encode)?;
        self.store.set_raw(key, raw, ttl.total_secs()).await
    }
}
