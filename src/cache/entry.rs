//! Stored cache entries.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ttl::Ttl;

/// A captured origin response.
///
/// Entries are snapshots: once built they are only ever read, cloned or
/// replaced wholesale by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub status: u16,
    /// Header snapshot in origin order; names are lower-case, values are
    /// the raw header bytes.
    pub headers: Vec<(String, Bytes)>,
    /// Payload of a body-sending completion. `None` for redirects.
    pub body: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<String>,
    /// Request path that produced a redirect entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    pub ttl: Ttl,
}

impl CacheEntry {
    pub fn response(
        key: impl Into<String>,
        status: u16,
        headers: Vec<(String, Bytes)>,
        body: Bytes,
        ttl: Ttl,
    ) -> Self {
        Self {
            key: key.into(),
            status,
            headers,
            body: Some(body),
            redirect_target: None,
            original_path: None,
            ttl,
        }
    }

    pub fn redirect(
        key: impl Into<String>,
        status: u16,
        headers: Vec<(String, Bytes)>,
        target: impl Into<String>,
        original_path: impl Into<String>,
        ttl: Ttl,
    ) -> Self {
        Self {
            key: key.into(),
            status,
            headers,
            body: None,
            redirect_target: Some(target.into()),
            original_path: Some(original_path.into()),
            ttl,
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect_target.is_some()
    }

    /// First header value with the given name, case-insensitively.
    ///
    /// `None` also when the stored value is not UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    }

    /// Value of the hit indicator for this entry: `ht <maxAge> <swr>`.
    pub fn hit_indicator(&self) -> String {
        format!(
            "{} {} {}",
            super::skip::HIT,
            self.ttl.max_age,
            self.ttl.stale_while_revalidate
        )
    }
}
