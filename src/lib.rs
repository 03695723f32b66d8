#![warn(missing_docs)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A server-side HTTP caching intermediary for Tower services.
//!
//! This crate sits between clients and an upstream origin handler and
//! implements the semantics of HTTP caching as defined in RFC 7234:
//! freshness, conditional revalidation, invalidation on state-changing
//! methods, and `Vary`-keyed variants. Each request is classified, answered
//! from the store when a fresh entry exists, revalidated upstream with
//! `If-None-Match`/`If-Modified-Since` when one might still be usable, and
//! otherwise forwarded, with storable replies written back by a background
//! worker pool so clients never wait on storage I/O.
//!
//! Storage is pluggable through the [`CacheManager`] trait; an in-memory
//! back-end built on [`moka`](https://github.com/moka-rs/moka) ships behind
//! the default `manager-moka` feature.
//!
//! # Example
//!
//! ```rust
//! # #[cfg(feature = "manager-moka")]
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use http_body_util::Full;
//! use http_cache_gateway::{CacheLayer, GatewayCache, GatewayOptions, MokaManager};
//! use tower::{Layer, Service, ServiceExt};
//!
//! let cache = GatewayCache::new(MokaManager::default(), GatewayOptions::default());
//! let layer = CacheLayer::new(cache.clone());
//!
//! let mut service = layer.layer(tower::service_fn(|_req: Request<Full<Bytes>>| async {
//!     Ok::<_, std::io::Error>(
//!         Response::builder()
//!             .header("cache-control", "max-age=60")
//!             .body(Full::new(Bytes::from("hello")))
//!             .unwrap(),
//!     )
//! }));
//!
//! let response = service
//!     .ready()
//!     .await?
//!     .call(Request::get("https://example.com/hello").body(Full::new(Bytes::new()))?)
//!     .await?;
//! assert_eq!(response.headers()["x-cache"], "MISS");
//!
//! // wait for the background store before shutting down
//! cache.drain().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Observable surface
//!
//! Responses carry `x-cache: HIT|MISS|SKIP`, and cache hits additionally
//! carry `Age`, `Via` and, when applicable, `Warning: 110`/`113`. An
//! unsatisfiable `only-if-cached` request yields `504 Gateway Timeout`; a
//! request that cannot be keyed yields `400`; a failing storage back-end
//! yields `500`.

mod body;
mod cache_control;
mod error;
mod handler;
mod key;
mod layer;
mod managers;
mod resource;
mod validator;
mod writer;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use url::Url;

pub use body::CacheBody;
pub use cache_control::CacheControl;
pub use error::{BoxError, CacheError, Result};
pub use handler::GatewayCache;
pub use key::{request_url, Key, RewriteRule};
pub use layer::{CacheLayer, CacheService};
pub use resource::Resource;

#[cfg(feature = "manager-moka")]
pub use managers::moka::MokaManager;

/// `x-cache` header: HIT when served from cache, MISS when fetched upstream
/// and stored, SKIP when forwarded without storing.
pub const XCACHE: &str = "x-cache";

/// `proxy-date` header: stamped on responses as they are written to the
/// store, so age can be computed even when the origin omits `Date`.
pub const PROXY_DATE: &str = "proxy-date";

/// How a response relates to the cache, reported in the `x-cache` header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the cache.
    Hit,
    /// Fetched upstream and written back.
    Miss,
    /// Forwarded upstream without storing.
    Skip,
}

impl CacheStatus {
    pub(crate) fn header_value(self) -> http::HeaderValue {
        match self {
            Self::Hit => http::HeaderValue::from_static("HIT"),
            Self::Miss => http::HeaderValue::from_static("MISS"),
            Self::Skip => http::HeaderValue::from_static("SKIP"),
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Miss => write!(f, "MISS"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

/// Source of "now" for all freshness and age calculations. Tests substitute
/// a controllable clock.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Configuration for the gateway cache.
#[derive(Clone)]
pub struct GatewayOptions {
    /// Shared-cache semantics: obey `private`, `s-maxage` and the
    /// `Authorization` restrictions. Disable for a single-user cache.
    pub shared: bool,
    /// URL canonicalisation rules consulted by the key builder.
    pub rewrites: Vec<RewriteRule>,
    /// Reserved hook for an external key-rewrite service. The URL is
    /// parsed and kept but not yet consulted; absence is a no-op.
    pub store_id_url: Option<Url>,
    /// Pseudonym written into the `Via` header on cache hits.
    pub via_pseudonym: String,
    /// Clock used for all age and freshness math.
    pub clock: Clock,
    /// Number of background write workers.
    pub write_workers: usize,
    /// Depth of the background write queue.
    pub write_queue_depth: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            shared: true,
            rewrites: Vec::new(),
            store_id_url: None,
            via_pseudonym: "http-cache-gateway".to_string(),
            clock: Arc::new(SystemTime::now),
            write_workers: 4,
            write_queue_depth: 64,
        }
    }
}

impl fmt::Debug for GatewayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayOptions")
            .field("shared", &self.shared)
            .field("rewrites", &self.rewrites)
            .field("store_id_url", &self.store_id_url)
            .field("via_pseudonym", &self.via_pseudonym)
            .field("clock", &"Fn() -> SystemTime")
            .field("write_workers", &self.write_workers)
            .field("write_queue_depth", &self.write_queue_depth)
            .finish()
    }
}

/// A trait providing methods for storing, retrieving, freshening and
/// removing cached resources.
///
/// Back-ends must provide read-your-writes for a single key and replace a
/// key's value atomically; no ordering across keys is required.
#[async_trait::async_trait]
pub trait CacheManager: Send + Sync + 'static {
    /// Attempts to pull a stored resource from cache.
    async fn retrieve(&self, key: &str) -> Result<Option<Resource>>;
    /// Stores a resource under each of the given keys.
    async fn store(&self, resource: Resource, keys: &[String]) -> Result<()>;
    /// Replaces the headers of the entry under `key`, leaving its body
    /// untouched. A missing entry stays missing.
    async fn freshen(&self, resource: Resource, key: &str) -> Result<()>;
    /// Removes the entry under `key`.
    async fn delete(&self, key: &str) -> Result<()>;
}
