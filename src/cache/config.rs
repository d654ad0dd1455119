//! Engine configuration.
//!
//! Read-only once an [`OutputCache`](super::OutputCache) is built. Loose
//! input shapes (a string where a list is expected, and so on) are
//! normalized here instead of failing deserialization.

use std::num::NonZeroUsize;

use serde::{Deserialize, Deserializer, de::IgnoredAny};

use super::ttl::Ttl;

// Default values for cache configuration
const DEFAULT_TTL_SECS: u64 = 600;
const DEFAULT_MAX_ITEMS: usize = 1000;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Which query parameters vary the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VaryByQuery {
    /// The whole raw query string is part of the key.
    #[default]
    All,
    /// Only the listed parameters, in list order.
    Names(Vec<String>),
    /// The query string never affects the key.
    Disabled,
}

impl VaryByQuery {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            Self::All
        } else {
            Self::Names(names)
        }
    }
}

/// Output cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default max-age in seconds, used when the origin sends no
    /// `Cache-Control` or when `use_cache_header` is off.
    pub ttl: u64,
    /// Capacity of the default in-memory store.
    pub max_items: usize,
    /// Default stale window in seconds.
    pub stale_while_revalidate: u64,
    #[serde(deserialize_with = "vary_by_query")]
    pub vary_by_query: VaryByQuery,
    /// Cookie names that vary the cache key, in key order.
    #[serde(deserialize_with = "name_list")]
    pub vary_by_cookies: Vec<String>,
    /// Resolve TTLs from the origin's `Cache-Control` header.
    pub use_cache_header: bool,
    /// Suppress the `x-output-cache` indicator.
    pub no_headers: bool,
    /// Honor per-request skip signals.
    pub allow_skip: bool,
    pub skip_3xx: bool,
    pub skip_4xx: bool,
    pub skip_5xx: bool,
    /// Keep the path's original casing in cache keys.
    pub case_sensitive: bool,
    /// Largest response body the middleware will capture.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL_SECS,
            max_items: DEFAULT_MAX_ITEMS,
            stale_while_revalidate: 0,
            vary_by_query: VaryByQuery::All,
            vary_by_cookies: Vec::new(),
            use_cache_header: true,
            no_headers: false,
            allow_skip: true,
            skip_3xx: false,
            skip_4xx: false,
            skip_5xx: false,
            case_sensitive: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl CacheConfig {
    /// The TTL used when the origin does not provide one.
    ///
    /// A `ttl` of zero falls back to the 600 second default.
    pub fn default_ttl(&self) -> Ttl {
        let max_age = if self.ttl == 0 {
            DEFAULT_TTL_SECS
        } else {
            self.ttl
        };
        Ttl::new(max_age, self.stale_while_revalidate)
    }

    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_items_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_items).unwrap_or(NonZeroUsize::MIN)
    }

    /// Whether the cache-status indicator is emitted.
    pub fn emits_headers(&self) -> bool {
        !self.no_headers
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVary {
    Flag(bool),
    Names(Vec<String>),
    Text(String),
    Other(IgnoredAny),
}

fn split_names(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn vary_by_query<'de, D>(deserializer: D) -> Result<VaryByQuery, D::Error>
where
    D: Deserializer<'de>,
{
    let vary = match RawVary::deserialize(deserializer)? {
        RawVary::Flag(true) => VaryByQuery::All,
        RawVary::Flag(false) => VaryByQuery::Disabled,
        RawVary::Names(names) => VaryByQuery::names(names),
        RawVary::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "false" => VaryByQuery::Disabled,
            "true" | "" => VaryByQuery::All,
            _ => VaryByQuery::names(split_names(&text)),
        },
        RawVary::Other(_) => VaryByQuery::All,
    };
    Ok(vary)
}

fn name_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = match RawVary::deserialize(deserializer)? {
        RawVary::Names(names) => names,
        RawVary::Text(text) => split_names(&text),
        RawVary::Flag(_) | RawVary::Other(_) => Vec::new(),
    };
    Ok(names)
}
