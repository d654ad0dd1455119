//! Output cache
//!
//! Sits in front of an origin handler and serves identical GET requests
//! from storage:
//!
//! - **Lookup**: forced-skip check, key derivation, provider `get`
//! - **Replay**: a hit is written from the stored entry, the origin never runs
//! - **Capture**: a miss runs the origin behind a [`CapturingWriter`], which
//!   resolves the TTL, applies the skip policy and stores the entry
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl = 600
//! max_items = 1000
//! vary_by_query = ["page"]
//! vary_by_cookies = ["locale"]
//! skip_4xx = true
//! # ... see config.rs for all options
//! ```

mod config;
mod engine;
mod entry;
mod events;
mod keys;
mod kv;
mod lock;
mod middleware;
mod provider;
mod request;
mod skip;
mod ttl;
mod writer;

pub use config::{CacheConfig, VaryByQuery};
pub use engine::{CaptureTicket, Lookup, OutputCache, OutputCacheBuilder};
pub use entry::CacheEntry;
pub use events::{CacheEvent, EventBus, ProviderOp};
pub use keys::KeyBuilder;
pub use kv::{JsonProvider, KeyValueStore};
pub use middleware::output_cache_layer;
pub use provider::{CacheProvider, MemoryProvider, ProviderError};
pub use request::CacheRequest;
pub use skip::{CACHE_STATUS_HEADER, HIT, MISS, SKIP_QUERY_FLAG, SkipPolicy, SkipReason};
pub use ttl::{Ttl, parse_cache_control};
pub use writer::{
    BufferedResponse, CapturingWriter, ResponseWriter, SendArgs, restore_headers,
    snapshot_headers,
};
