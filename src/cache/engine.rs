//! The output cache engine.
//!
//! Per request: `lookup` decides between forwarding, replaying a hit, or
//! capturing a miss. Capture happens through [`CapturingWriter`], which
//! calls back into [`OutputCache::persist`] when the origin completes.

use std::{panic::AssertUnwindSafe, sync::Arc};

use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use futures::FutureExt;
use metrics::counter;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    config::CacheConfig,
    entry::CacheEntry,
    events::{CacheEvent, EventBus, ProviderOp},
    keys::KeyBuilder,
    provider::{CacheProvider, MemoryProvider, ProviderError},
    request::CacheRequest,
    skip::{CACHE_STATUS_HEADER, MISS, SkipPolicy},
    ttl::{Ttl, parse_cache_control},
    writer::{CapturingWriter, ResponseWriter, SendArgs, restore_headers},
};

const CACHE_CONTROL: &str = "cache-control";

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// Serve this entry; the origin must not run.
    Hit(Arc<CacheEntry>),
    /// Run the origin and capture its response under the ticket's key.
    Miss(CaptureTicket),
    /// Run the origin without touching storage: the request forced a skip
    /// or the provider failed.
    Forward,
}

/// Identifies the entry a miss should be stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTicket {
    key: String,
    path: String,
}

impl CaptureTicket {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A completion observed by the capturing writer.
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Body { status: u16, body: Bytes },
    Redirect { status: u16, target: String },
}

impl Completion {
    fn status(&self) -> u16 {
        match self {
            Self::Body { status, .. } | Self::Redirect { status, .. } => *status,
        }
    }
}

struct Inner {
    config: CacheConfig,
    keys: KeyBuilder,
    skip: SkipPolicy,
    provider: Arc<dyn CacheProvider>,
    events: EventBus,
}

/// Response cache shared by all requests of one mount point.
///
/// Cloning is cheap. Separate instances have separate configuration,
/// storage and event channels.
#[derive(Clone)]
pub struct OutputCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OutputCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCache")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`OutputCache`].
pub struct OutputCacheBuilder {
    config: CacheConfig,
    provider: Option<Arc<dyn CacheProvider>>,
    event_capacity: Option<usize>,
}

impl OutputCacheBuilder {
    /// Use a custom storage backend instead of the in-memory LRU.
    pub fn provider(mut self, provider: Arc<dyn CacheProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Capacity of the event channel per subscriber.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> OutputCache {
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(MemoryProvider::new(&self.config)));
        let events = self
            .event_capacity
            .map(EventBus::new)
            .unwrap_or_default();

        OutputCache {
            inner: Arc::new(Inner {
                keys: KeyBuilder::from_config(&self.config),
                skip: SkipPolicy::from_config(&self.config),
                config: self.config,
                provider,
                events,
            }),
        }
    }
}

impl OutputCache {
    /// Engine with the default in-memory provider.
    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> OutputCacheBuilder {
        OutputCacheBuilder {
            config,
            provider: None,
            event_capacity: None,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn cache_key(&self, request: &CacheRequest) -> String {
        self.inner.keys.build(request)
    }

    /// Decide how to serve `request`.
    ///
    /// Never fails: provider errors are reported as events and turn into
    /// [`Lookup::Forward`].
    pub async fn lookup(&self, request: &CacheRequest) -> Lookup {
        let path = request.path_and_query();

        if self.inner.skip.is_forced_skip(request) {
            counter!("outcache_skip_total", "reason" => "forced").increment(1);
            self.inner.events.emit(CacheEvent::Miss { path });
            return Lookup::Forward;
        }

        let key = self.inner.keys.build(request);
        match self.provider_get(&key).await {
            Ok(Some(entry)) => {
                let entry = Arc::new(entry);
                self.inner.events.emit(CacheEvent::Hit(Arc::clone(&entry)));
                Lookup::Hit(entry)
            }
            Ok(None) => {
                self.inner.events.emit(CacheEvent::Miss { path: path.clone() });
                Lookup::Miss(CaptureTicket { key, path })
            }
            Err(error) => {
                self.inner.events.emit(CacheEvent::Miss { path });
                self.report_provider_error(ProviderOp::Get, error);
                Lookup::Forward
            }
        }
    }

    /// Write a stored entry through `writer` without involving the origin.
    pub async fn replay<W>(&self, entry: &CacheEntry, writer: &mut W)
    where
        W: ResponseWriter + ?Sized,
    {
        restore_headers(writer.headers_mut(), &entry.headers);

        if self.inner.config.emits_headers() {
            if let Ok(value) = HeaderValue::from_str(&entry.hit_indicator()) {
                writer.headers_mut().insert(CACHE_STATUS_HEADER, value);
            }
        }

        match &entry.redirect_target {
            Some(target) => writer.redirect(Some(entry.status), target).await,
            None => {
                let body = entry.body.clone().unwrap_or_default();
                writer
                    .send(SendArgs::StatusAndBody(entry.status, body))
                    .await
            }
        }
    }

    /// Wrap the origin's writer.
    ///
    /// With a ticket from [`Lookup::Miss`] the completion is captured;
    /// without one the writer only marks the response as a miss.
    pub fn capture<W: ResponseWriter>(
        &self,
        ticket: Option<CaptureTicket>,
        writer: W,
    ) -> CapturingWriter<W> {
        CapturingWriter::new(self.clone(), ticket, writer)
    }

    /// Set the miss indicator, unless header emission is disabled.
    pub fn mark_miss(&self, headers: &mut HeaderMap) {
        if self.inner.config.emits_headers() {
            headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(MISS));
        }
    }

    /// Store a captured completion if policy allows it.
    pub(crate) async fn persist(
        &self,
        ticket: CaptureTicket,
        mut headers: Vec<(String, Bytes)>,
        completion: Completion,
    ) {
        let config = &self.inner.config;

        let cache_control = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CACHE_CONTROL))
            .map(|(_, value)| String::from_utf8_lossy(value).into_owned());
        let cache_control = match cache_control {
            Some(value) => value,
            None => {
                let value = config.default_ttl().to_cache_control();
                headers.push((CACHE_CONTROL.to_string(), Bytes::from(value.clone())));
                value
            }
        };

        let ttl = if config.use_cache_header {
            parse_cache_control(Some(&cache_control))
        } else {
            config.default_ttl()
        };

        let status = completion.status();
        if let Err(reason) = self.inner.skip.check_storage(status, ttl) {
            counter!("outcache_skip_total", "reason" => reason.as_str()).increment(1);
            debug!(
                cache = "output",
                key = %ticket.key,
                status,
                reason = reason.as_str(),
                "not storing response"
            );
            return;
        }

        let entry = match completion {
            Completion::Body { status, body } => {
                CacheEntry::response(ticket.key.clone(), status, headers, body, ttl)
            }
            Completion::Redirect { status, target } => CacheEntry::redirect(
                ticket.key.clone(),
                status,
                headers,
                target,
                ticket.path,
                ttl,
            ),
        };

        match self.provider_set(&ticket.key, entry, ttl).await {
            Ok(()) => {
                counter!("outcache_store_total").increment(1);
                debug!(
                    cache = "output",
                    key = %ticket.key,
                    status,
                    max_age = ttl.max_age,
                    stale_while_revalidate = ttl.stale_while_revalidate,
                    "stored response"
                );
            }
            Err(error) => self.report_provider_error(ProviderOp::Set, error),
        }
    }

    async fn provider_get(&self, key: &str) -> Result<Option<CacheEntry>, ProviderError> {
        let provider = &self.inner.provider;
        AssertUnwindSafe(async { provider.get(key).await })
            .catch_unwind()
            .await
            .unwrap_or(Err(ProviderError::Panicked { operation: "get" }))
    }

    async fn provider_set(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Ttl,
    ) -> Result<(), ProviderError> {
        let provider = &self.inner.provider;
        AssertUnwindSafe(async { provider.set(key, entry, ttl).await })
            .catch_unwind()
            .await
            .unwrap_or(Err(ProviderError::Panicked { operation: "set" }))
    }

    fn report_provider_error(&self, operation: ProviderOp, error: ProviderError) {
        self.inner.events.emit(CacheEvent::ProviderError {
            operation,
            error: Arc::new(error),
        });
    }
}
