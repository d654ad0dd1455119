//! outcache: an output cache layer for axum services.
//!
//! ```rust,no_run
//! use axum::{Router, middleware, routing::get};
//! use outcache::cache::{CacheConfig, OutputCache, output_cache_layer};
//!
//! let cache = OutputCache::new(CacheConfig::default());
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "hello" }))
//!     .layer(middleware::from_fn_with_state(cache, output_cache_layer));
//! ```

pub mod cache;
pub mod config;
pub mod infra;
