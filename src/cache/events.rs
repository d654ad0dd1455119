//! Cache event channel.
//!
//! Each engine instance owns one broadcast channel. Events are also logged
//! and counted so that deployments without subscribers still see them.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{entry::CacheEntry, provider::ProviderError};

const DEFAULT_CAPACITY: usize = 256;

/// Provider operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOp {
    Get,
    Set,
}

impl ProviderOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
        }
    }
}

/// Observable cache outcome.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A stored entry was served.
    Hit(Arc<CacheEntry>),
    /// The origin was invoked for `path` (path and query).
    Miss { path: String },
    /// A provider call failed; the request was treated as a miss.
    ProviderError {
        operation: ProviderOp,
        error: Arc<ProviderError>,
    },
}

impl CacheEvent {
    /// Event name as exposed to observers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hit(_) => "hit",
            Self::Miss { .. } => "miss",
            Self::ProviderError { .. } => "cacheProviderError",
        }
    }
}

/// Fan-out of [`CacheEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Record and publish an event.
    ///
    /// Publishing never fails; with no subscribers the event is dropped
    /// after being logged.
    pub fn emit(&self, event: CacheEvent) {
        match &event {
            CacheEvent::Hit(entry) => {
                counter!("outcache_hit_total").increment(1);
                debug!(
                    cache = "output",
                    outcome = "hit",
                    key = %entry.key,
                    status = entry.status,
                    max_age = entry.ttl.max_age,
                    stale_while_revalidate = entry.ttl.stale_while_revalidate,
                    redirect = entry.is_redirect(),
                    "serving cached response"
                );
            }
            CacheEvent::Miss { path } => {
                counter!("outcache_miss_total").increment(1);
                debug!(cache = "output", outcome = "miss", path = %path, "forwarding to origin");
            }
            CacheEvent::ProviderError { operation, error } => {
                counter!("outcache_provider_error_total", "op" => operation.as_str()).increment(1);
                warn!(
                    cache = "output",
                    op = operation.as_str(),
                    error = %error,
                    "cache provider failed, treating request as a miss"
                );
            }
        }

        let _ = self.sender.send(event);
    }
}
