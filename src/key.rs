//! Cache key derivation.

use std::fmt;

use http::header::{CONTENT_LOCATION, HOST};
use http::{request, HeaderMap};
use url::Url;

use crate::error::{CacheError, Result};

/// A URL canonicalisation rule consulted by the key builder.
///
/// Query strings that only carry signed-URL tokens fragment the cache: the
/// same object is fetched under an ever-changing query and from rotating
/// mirror hosts. A rule collapses those requests onto one canonical key by
/// replacing the host and optionally dropping the query, when both the host
/// suffix and one of the path suffixes match.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    /// Suffix the URL host must end with.
    pub host_suffix: String,
    /// Path suffixes (typically file extensions); any match qualifies.
    pub path_suffixes: Vec<String>,
    /// Host substituted into the canonical URL.
    pub replacement_host: String,
    /// Drop the query string from the canonical URL.
    pub strip_query: bool,
}

impl RewriteRule {
    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        host.ends_with(&self.host_suffix)
            && self.path_suffixes.iter().any(|suffix| url.path().ends_with(suffix.as_str()))
    }

    fn apply(&self, url: &mut Url) {
        if url.set_host(Some(&self.replacement_host)).is_err() {
            return;
        }
        if self.strip_query {
            url.set_query(None);
        }
    }
}

/// A primary or secondary cache key.
///
/// Two requests with the same method, canonical URL, and identical values
/// for every header on the Vary axis encode to byte-identical strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    method: String,
    url: Url,
    vary: Vec<String>,
}

impl Key {
    /// Builds a key from a bare method and URL, with an empty Vary axis.
    pub fn new(method: &str, url: Url) -> Self {
        Self { method: method.to_ascii_uppercase(), url, vary: Vec::new() }
    }

    /// Builds a key for a URL after running it through the rewrite table.
    pub fn for_url(method: &str, mut url: Url, rules: &[RewriteRule]) -> Self {
        if let Some(rule) = rules.iter().find(|rule| rule.matches(&url)) {
            rule.apply(&mut url);
        }
        Self::new(method, url)
    }

    /// Derives the primary key for a request.
    ///
    /// The URL is cloned, canonicalised through the rewrite table, and then
    /// replaced by a same-host `Content-Location` target when the request
    /// carries one; foreign hosts are ignored.
    pub fn for_request(parts: &request::Parts, url: &Url, rules: &[RewriteRule]) -> Self {
        let mut key = Self::for_url(parts.method.as_str(), url.clone(), rules);
        if let Some(substituted) = content_location_url(parts, &key.url) {
            key.url = substituted;
        }
        key
    }

    /// Copy of the key with the method replaced.
    pub fn for_method(&self, method: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: self.url.clone(),
            vary: self.vary.clone(),
        }
    }

    /// Copy of the key extended with the Vary axis for `vary_header`.
    ///
    /// Pairs are appended in header-list order; a header the request does
    /// not carry contributes an empty value.
    pub fn vary(&self, vary_header: &str, headers: &HeaderMap) -> Self {
        let mut key = self.clone();
        for name in vary_header.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            let value = headers.get(name.as_str()).and_then(|v| v.to_str().ok()).unwrap_or("");
            key.vary.push(format!("{name}={value}"));
        }
        key
    }

    /// The canonical URL the key was built from.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method, self.url.as_str().to_lowercase())?;
        if !self.vary.is_empty() {
            write!(f, "::")?;
            for pair in &self.vary {
                write!(f, "{pair}:")?;
            }
        }
        Ok(())
    }
}

fn content_location_url(parts: &request::Parts, base: &Url) -> Option<Url> {
    let value = parts.headers.get(CONTENT_LOCATION)?.to_str().ok()?;
    let resolved = base.join(value).ok()?;
    if resolved.host_str() == base.host_str() {
        Some(resolved)
    } else {
        None
    }
}

/// Derives the effective URL for an incoming request.
///
/// Absolute request URIs are used directly. Otherwise the URL is rebuilt
/// from the `Host` header, with the scheme taken from `x-forwarded-proto`
/// when a fronting proxy supplies it. A relative request line without a
/// `Host` header cannot be keyed and is rejected.
pub fn request_url(parts: &request::Parts) -> Result<Url> {
    if parts.uri.scheme().is_some() {
        return Ok(Url::parse(&parts.uri.to_string())?);
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            CacheError::MalformedRequest("missing Host header on HTTP/1.1 request".into())
        })?;

    let scheme = determine_scheme(host, &parts.headers);
    let mut url = Url::parse(&format!("{scheme}://{host}/"))?;
    if let Some(path_and_query) = parts.uri.path_and_query() {
        url.set_path(path_and_query.path());
        url.set_query(path_and_query.query());
    }
    Ok(url)
}

fn determine_scheme(host: &str, headers: &HeaderMap) -> &'static str {
    if let Some(proto) = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()) {
        return if proto == "http" { "http" } else { "https" };
    }
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    }
}
