//! TTL resolution from `Cache-Control` directives.
//!
//! Only three things matter to the output cache: the `no-store`/`no-cache`/
//! `private` tokens, `max-age=<n>` and `stale-while-revalidate=<n>`.
//! Anything else in the header is ignored.

use serde::{Deserialize, Serialize};

const MAX_AGE: &str = "max-age=";
const STALE_WHILE_REVALIDATE: &str = "stale-while-revalidate=";
const NON_CACHEABLE: [&str; 3] = ["no-store", "no-cache", "private"];

/// Freshness lifetime of a cache entry, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ttl {
    pub max_age: u64,
    pub stale_while_revalidate: u64,
}

impl Ttl {
    /// The "do not persist" value.
    pub const ZERO: Ttl = Ttl {
        max_age: 0,
        stale_while_revalidate: 0,
    };

    pub const fn new(max_age: u64, stale_while_revalidate: u64) -> Self {
        Self {
            max_age,
            stale_while_revalidate,
        }
    }

    /// Returns true when an entry with this TTL may be stored.
    pub fn is_storable(&self) -> bool {
        self.max_age > 0
    }

    /// Total lifetime including the stale window.
    pub fn total_secs(&self) -> u64 {
        self.max_age.saturating_add(self.stale_while_revalidate)
    }

    /// Renders the directive synthesized for responses without a
    /// `Cache-Control` header.
    ///
    /// The stale window is only written when it is non-zero.
    pub fn to_cache_control(&self) -> String {
        if self.stale_while_revalidate > 0 {
            format!(
                "max-age={}, stale-while-revalidate={}",
                self.max_age, self.stale_while_revalidate
            )
        } else {
            format!("max-age={}", self.max_age)
        }
    }
}

/// Resolve a [`Ttl`] from a `Cache-Control` header value.
///
/// Never fails: an absent or malformed header resolves to [`Ttl::ZERO`]
/// for the parts that cannot be read.
pub fn parse_cache_control(header: Option<&str>) -> Ttl {
    let Some(header) = header else {
        return Ttl::ZERO;
    };

    let header = header.to_ascii_lowercase();
    if NON_CACHEABLE.iter().any(|token| header.contains(token)) {
        return Ttl::ZERO;
    }

    Ttl {
        max_age: seconds_after(&header, MAX_AGE).unwrap_or(0),
        stale_while_revalidate: seconds_after(&header, STALE_WHILE_REVALIDATE).unwrap_or(0),
    }
}

/// Reads the run of digits right after the first occurrence of `directive`.
fn seconds_after(header: &str, directive: &str) -> Option<u64> {
    let start = header.find(directive)? + directive.len();
    let rest = header[start..].trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}
