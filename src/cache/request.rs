//! Request-local signals consulted by the cache.

use axum::http::{HeaderMap, Uri, header::COOKIE};
use axum_extra::extract::cookie::CookieJar;

use super::skip::CACHE_STATUS_HEADER;

/// The parts of an inbound request that can influence caching.
///
/// Built once per request; every component that reads it is synchronous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheRequest {
    path: String,
    raw_query: Option<String>,
    query: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    status_header: Option<String>,
}

impl CacheRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Extract signals from an HTTP request head.
    pub fn from_parts(uri: &Uri, headers: &HeaderMap) -> Self {
        let mut request = Self::new(uri.path()).with_query(uri.query());

        if headers.contains_key(COOKIE) {
            let jar = CookieJar::from_headers(headers);
            request.cookies = jar
                .iter()
                .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
                .collect();
        }

        request.status_header = headers
            .get(CACHE_STATUS_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        request
    }

    /// Attach a raw query string (without the leading `?`).
    pub fn with_query(mut self, raw: Option<&str>) -> Self {
        match raw.filter(|raw| !raw.is_empty()) {
            Some(raw) => {
                self.query = url::form_urlencoded::parse(raw.as_bytes())
                    .into_owned()
                    .collect();
                self.raw_query = Some(raw.to_string());
            }
            None => {
                self.query.clear();
                self.raw_query = None;
            }
        }
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn with_status_header(mut self, value: impl Into<String>) -> Self {
        self.status_header = Some(value.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Value of the inbound cache-status header, if any.
    pub fn status_header(&self) -> Option<&str> {
        self.status_header.as_deref()
    }

    /// Path plus query, as reported in miss events.
    pub fn path_and_query(&self) -> String {
        match &self.raw_query {
            Some(raw) => format!("{}?{}", self.path, raw),
            None => self.path.clone(),
        }
    }
}
