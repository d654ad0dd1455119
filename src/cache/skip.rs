//! Skip policy: per-request opt-outs and status-based storage suppression.

use super::{config::CacheConfig, request::CacheRequest, ttl::Ttl};

/// Header (and cookie) carrying the cache-status indicator.
pub const CACHE_STATUS_HEADER: &str = "x-output-cache";
/// Indicator value for a miss, and the inbound value that forces a skip.
pub const MISS: &str = "ms";
/// Indicator prefix for a hit.
pub const HIT: &str = "ht";
/// Query flag that forces a skip when set to `false`.
pub const SKIP_QUERY_FLAG: &str = "cache";

/// Why a captured response was not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The status class is excluded by configuration.
    Status(u16),
    /// The resolved max-age is zero.
    NotCacheable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::NotCacheable => "not_cacheable",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipPolicy {
    allow_skip: bool,
    skip_3xx: bool,
    skip_4xx: bool,
    skip_5xx: bool,
}

impl SkipPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            allow_skip: config.allow_skip,
            skip_3xx: config.skip_3xx,
            skip_4xx: config.skip_4xx,
            skip_5xx: config.skip_5xx,
        }
    }

    /// Returns true when the request explicitly asks to bypass the cache
    /// and skipping is allowed.
    pub fn is_forced_skip(&self, request: &CacheRequest) -> bool {
        self.allow_skip
            && (request.status_header() == Some(MISS)
                || request.query_param(SKIP_QUERY_FLAG) == Some("false")
                || request.cookie(CACHE_STATUS_HEADER) == Some(MISS))
    }

    /// Returns true when responses with `status` must not be stored.
    pub fn skips_status(&self, status: u16) -> bool {
        match status {
            300..=399 => self.skip_3xx,
            400..=499 => self.skip_4xx,
            500.. => self.skip_5xx,
            _ => false,
        }
    }

    /// Decide whether a captured response may be persisted.
    pub fn check_storage(&self, status: u16, ttl: Ttl) -> Result<(), SkipReason> {
        if self.skips_status(status) {
            return Err(SkipReason::Status(status));
        }
        if !ttl.is_storable() {
            return Err(SkipReason::NotCacheable);
        }
        Ok(())
    }
}
