//! Stored-response view and its derived freshness quantities.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{AGE, DATE, ETAG, EXPIRES, LAST_MODIFIED, SET_COOKIE};
use http::{HeaderMap, HeaderName, StatusCode};
use serde::{Deserialize, Serialize};

use crate::cache_control::CacheControl;
use crate::error::{CacheError, Result};
use crate::PROXY_DATE;

// Since the stored body is reused, headers describing it are never merged
// during revalidation.
const EXCLUDED_FROM_FRESHEN: &[&str] =
    &["content-length", "content-encoding", "transfer-encoding", "content-range"];

/// A stored response: status, headers, body bytes and the time of the
/// request that produced it.
///
/// Serialization round-trips the header map exactly, so persistent
/// back-ends can store resources without reinterpreting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// HTTP status of the stored response.
    #[serde(with = "http_serde::status_code")]
    pub status: StatusCode,
    /// Full stored header map.
    #[serde(with = "http_serde::header_map")]
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Bytes,
    /// When the request that produced this response was sent upstream.
    pub request_time: SystemTime,
}

impl Resource {
    /// Builds a resource from its parts.
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        request_time: SystemTime,
    ) -> Self {
        Self { status, headers, body, request_time }
    }

    /// First value of a header, when it is valid UTF-8.
    pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub(crate) fn cache_control(&self) -> Result<CacheControl> {
        CacheControl::from_headers(&self.headers)
    }

    fn time_header(&self, name: impl http::header::AsHeaderName) -> Option<SystemTime> {
        self.header(name).and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// Raw `Age` header in seconds; zero when absent or invalid.
    pub fn age_header(&self) -> Duration {
        self.header(AGE)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_default()
    }

    /// Current age of the stored response.
    ///
    /// Prefers the `Proxy-Date` stamped when the response was written, so
    /// the corrected age recorded at store time keeps growing with the
    /// clock; falls back to the origin `Date`. Without either there is no
    /// way to age the response.
    pub fn current_age(&self, now: SystemTime) -> Result<Duration> {
        let age = self.age_header();
        if let Some(proxy_date) = self.time_header(PROXY_DATE) {
            return Ok(age + now.duration_since(proxy_date).unwrap_or_default());
        }
        if let Some(date) = self.time_header(DATE) {
            return Ok(now.duration_since(date).unwrap_or_default());
        }
        Err(CacheError::UnknownAge)
    }

    /// Explicit freshness lifetime: `s-maxage` for shared caches, else
    /// `max-age`. [`CacheError::NoMaxAge`] signals that neither is present.
    pub fn max_age(&self, shared: bool) -> Result<Duration> {
        let control = self.cache_control()?;
        if shared && control.has("s-maxage") {
            return control.duration("s-maxage");
        }
        if control.has("max-age") {
            return control.duration("max-age");
        }
        Err(CacheError::NoMaxAge)
    }

    /// Freshness inferred from `Last-Modified` alone: 10% of the time since
    /// modification.
    pub fn heuristic_freshness(&self, now: SystemTime) -> Duration {
        match self.last_modified() {
            Some(modified) => now.duration_since(modified).unwrap_or_default() / 10,
            None => Duration::ZERO,
        }
    }

    /// Whether the response names its own lifetime, through a max-age
    /// directive or an `Expires` header.
    pub fn has_explicit_expiration(&self, shared: bool) -> bool {
        let Ok(control) = self.cache_control() else {
            return false;
        };
        control.has("max-age")
            || (shared && control.has("s-maxage"))
            || self.headers.contains_key(EXPIRES)
    }

    /// Whether the response carries an `ETag` or `Last-Modified` to
    /// revalidate against.
    pub fn has_validators(&self) -> bool {
        self.headers.contains_key(ETAG) || self.headers.contains_key(LAST_MODIFIED)
    }

    /// Whether the response demands revalidation before reuse. An
    /// unparseable stored `Cache-Control` also forces validation.
    pub fn must_validate(&self, shared: bool) -> bool {
        let Ok(control) = self.cache_control() else {
            return true;
        };
        control.has("no-cache")
            || control.has("must-revalidate")
            || (shared && control.has("proxy-revalidate"))
    }

    /// Expired per the `Expires` header, with no `max-age` override.
    pub fn is_stale(&self, now: SystemTime) -> bool {
        let Some(expires) = self.time_header(EXPIRES) else {
            return false;
        };
        let has_max_age =
            self.cache_control().map(|control| control.has("max-age")).unwrap_or(false);
        expires < now && !has_max_age
    }

    /// Stored `Last-Modified`, when present and parseable.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.time_header(LAST_MODIFIED)
    }

    /// Strips `Set-Cookie` and any header named by a `private="..."`
    /// directive argument.
    pub fn remove_private_headers(&mut self) {
        self.headers.remove(SET_COOKIE);
        if let Ok(control) = self.cache_control() {
            for value in control.values("private") {
                for name in value.split(',') {
                    if let Ok(name) = name.trim().parse::<HeaderName>() {
                        self.headers.remove(name);
                    }
                }
            }
        }
    }

    /// Merges headers from a 304 validation response into the stored set.
    /// Body-describing headers are kept as stored, since the body itself is
    /// reused.
    pub fn freshen_from(&mut self, fresh: &HeaderMap) {
        let names: Vec<HeaderName> = fresh.keys().cloned().collect();
        for name in names {
            if EXCLUDED_FROM_FRESHEN.contains(&name.as_str()) {
                continue;
            }
            let values: Vec<_> = fresh.get_all(&name).iter().cloned().collect();
            self.headers.remove(&name);
            for value in values {
                self.headers.append(name.clone(), value);
            }
        }
    }
}
