//! The request lifecycle: cacheability, lookup, freshness, validation,
//! serve, pass, store, invalidate.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::header::{
    AGE, AUTHORIZATION, CONTENT_LENGTH, CONTENT_LOCATION, CONTENT_RANGE, DATE, ETAG, IF_MATCH,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, IF_UNMODIFIED_SINCE, LOCATION, RANGE, VARY, VIA,
};
use http::{request, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body::Body as HttpBody;
use tower::Service;
use url::Url;

use crate::body::{CacheBody, Captured};
use crate::cache_control::CacheControl;
use crate::error::{BoxError, CacheError, Result};
use crate::key::{request_url, Key};
use crate::resource::Resource;
use crate::validator::{self, Validation};
use crate::writer::{WriteJob, WritePool};
use crate::{CacheManager, CacheStatus, GatewayOptions, PROXY_DATE, XCACHE};

// rfc7234 3: statuses permitted into the store at all
const STOREABLE_STATUSES: &[u16] = &[200, 203, 300, 301, 302, 404, 410];

// rfc7231 6.1: statuses cacheable without explicit freshness or `public`
const CACHEABLE_BY_DEFAULT_STATUSES: &[u16] = &[200, 203, 206, 300, 301, 302, 304, 410];

const WARNING: &str = "warning";
const DAY: Duration = Duration::from_secs(24 * 3600);

/// Immutable view of a request held for the lifetime of one exchange.
struct RequestView {
    parts: request::Parts,
    url: Url,
    key: Key,
    control: CacheControl,
    received_at: SystemTime,
}

impl RequestView {
    /// A request the cache may answer: GET or HEAD, no conditional-update
    /// headers, and no directives that bypass stored responses.
    fn is_cacheable(&self) -> bool {
        (self.parts.method == Method::GET || self.parts.method == Method::HEAD)
            && !self.parts.headers.contains_key(IF_MATCH)
            && !self.parts.headers.contains_key(IF_UNMODIFIED_SINCE)
            && !self.parts.headers.contains_key(IF_RANGE)
            && !self.control.has("no-store")
            && !self.control.has("no-cache")
            && self.control.get("max-age") != Some("0")
    }

    fn is_state_changing(&self) -> bool {
        self.parts.method == Method::POST
            || self.parts.method == Method::PUT
            || self.parts.method == Method::DELETE
    }
}

/// The cache decision engine.
///
/// Classifies each request, consults the store, evaluates freshness,
/// orchestrates conditional revalidation and schedules background writes.
/// Wrap it around an upstream service with [`CacheLayer`](crate::CacheLayer).
pub struct GatewayCache<M> {
    manager: Arc<M>,
    options: GatewayOptions,
    writer: WritePool,
}

impl<M> Clone for GatewayCache<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            options: self.options.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<M> fmt::Debug for GatewayCache<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCache").field("options", &self.options).finish_non_exhaustive()
    }
}

impl<M: CacheManager> GatewayCache<M> {
    /// Creates the engine and starts its background write pool.
    ///
    /// The pool spawns onto the current tokio runtime, so this must be
    /// called from within one.
    pub fn new(manager: M, options: GatewayOptions) -> Self {
        let manager = Arc::new(manager);
        let writer =
            WritePool::new(manager.clone(), options.write_workers, options.write_queue_depth);
        Self { manager, options, writer }
    }

    /// Waits until every scheduled store, freshen and invalidation has
    /// completed. Call before shutdown so no cache write is lost.
    pub async fn drain(&self) {
        self.writer.drain().await;
    }

    fn now(&self) -> SystemTime {
        (self.options.clock)()
    }

    pub(crate) async fn handle<S, ReqBody, ResBody>(
        &self,
        mut upstream: S,
        req: Request<ReqBody>,
    ) -> std::result::Result<Response<CacheBody>, BoxError>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>>,
        S::Error: Into<BoxError>,
        ResBody: HttpBody,
        ResBody::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let url = match request_url(&parts) {
            Ok(url) => url,
            Err(err) => {
                log::debug!("refusing request: {err}");
                return Ok(refuse(StatusCode::BAD_REQUEST));
            }
        };
        let control = match CacheControl::from_headers(&parts.headers) {
            Ok(control) => control,
            Err(err) => {
                log::debug!("refusing request to {url}: {err}");
                return Ok(refuse(StatusCode::BAD_REQUEST));
            }
        };
        let key = Key::for_request(&parts, &url, &self.options.rewrites);
        let view = RequestView { parts, url, key, control, received_at: self.now() };

        if !view.is_cacheable() {
            return self.pipe(&mut upstream, view, body).await;
        }

        let stored = match self.lookup(&view).await {
            Ok(stored) => stored,
            Err(err) => {
                log::error!("cache lookup failed for {}: {err}", view.key);
                return Ok(refuse(StatusCode::INTERNAL_SERVER_ERROR));
            }
        };

        match stored {
            None => {
                if view.control.has("only-if-cached") {
                    return Ok(refuse_only_if_cached());
                }
                self.pass(&mut upstream, view, body).await
            }
            Some(resource) => {
                if self.needs_validation(&resource, &view, self.now()) {
                    if view.control.has("only-if-cached") {
                        return Ok(refuse_only_if_cached());
                    }
                    self.validate(&mut upstream, view, body, resource).await
                } else {
                    match self.serve(resource, &view) {
                        Ok(response) => Ok(response),
                        Err(err) => {
                            log::error!("serving {} from cache failed: {err}", view.key);
                            Ok(refuse(StatusCode::INTERNAL_SERVER_ERROR))
                        }
                    }
                }
            }
        }
    }

    /// Primary lookup, the HEAD-from-GET fallback, and the secondary
    /// retrieve along a stored Vary axis.
    async fn lookup(&self, view: &RequestView) -> Result<Option<Resource>> {
        let mut found = live(self.manager.retrieve(&view.key.to_string()).await?);

        // a GET entry may answer a HEAD when it names its own lifetime
        if found.is_none() && view.parts.method == Method::HEAD {
            let get_key = view.key.for_method("GET");
            found = live(self.manager.retrieve(&get_key.to_string()).await?)
                .filter(|resource| resource.has_explicit_expiration(self.options.shared));
        }

        // the secondary lookup's outcome is final, found or not
        if let Some(resource) = &found {
            if let Some(vary) = resource.header(VARY).map(str::to_owned) {
                let secondary = view.key.vary(&vary, &view.parts.headers);
                found = live(self.manager.retrieve(&secondary.to_string()).await?);
            }
        }

        Ok(found)
    }

    /// Remaining freshness in signed seconds; negative values are how far
    /// past its lifetime the response is.
    fn freshness(&self, resource: &Resource, view: &RequestView, now: SystemTime) -> Result<i64> {
        let mut max_age = match resource.max_age(self.options.shared) {
            Ok(explicit) => explicit.as_secs() as i64,
            Err(CacheError::NoMaxAge) => 0,
            Err(err) => return Err(err),
        };
        if view.control.has("max-age") {
            if let Ok(requested) = view.control.duration("max-age") {
                max_age = max_age.min(requested.as_secs() as i64);
            }
        }
        let age = resource.current_age(now)?.as_secs() as i64;
        if resource.is_stale(now) {
            return Ok(0);
        }
        let heuristic = resource.heuristic_freshness(now).as_secs() as i64;
        if heuristic > max_age {
            max_age = heuristic;
        }
        Ok(max_age - age)
    }

    fn needs_validation(&self, resource: &Resource, view: &RequestView, now: SystemTime) -> bool {
        if resource.must_validate(self.options.shared) {
            return true;
        }
        let freshness = match self.freshness(resource, view, now) {
            Ok(freshness) => freshness,
            Err(_) => return true,
        };
        if view.control.has("min-fresh") {
            if let Ok(min_fresh) = view.control.duration("min-fresh") {
                if freshness < min_fresh.as_secs() as i64 {
                    return true;
                }
            }
        }
        if freshness <= 0 {
            let excused = view.control.has("max-stale")
                && match view.control.get("max-stale") {
                    None => true,
                    Some(_) => view
                        .control
                        .duration("max-stale")
                        .map(|limit| -freshness <= limit.as_secs() as i64)
                        .unwrap_or(false),
                };
            return !excused;
        }
        false
    }

    /// Whether an upstream response may be written to the store.
    fn is_cacheable_response(
        &self,
        resource: &Resource,
        view: &RequestView,
        now: SystemTime,
    ) -> bool {
        let shared = self.options.shared;
        let Ok(control) = resource.cache_control() else {
            return false;
        };
        if control.has("no-cache") || control.has("no-store") {
            return false;
        }
        if shared && control.has("private") {
            return false;
        }
        if !STOREABLE_STATUSES.contains(&resource.status.as_u16()) {
            return false;
        }
        if shared && view.parts.headers.contains_key(AUTHORIZATION) {
            return false;
        }
        if shared
            && resource.headers.contains_key(AUTHORIZATION)
            && !control.has("must-revalidate")
            && !control.has("s-maxage")
        {
            return false;
        }
        resource.has_explicit_expiration(shared)
            || ((CACHEABLE_BY_DEFAULT_STATUSES.contains(&resource.status.as_u16())
                || control.has("public"))
                && (resource.has_validators()
                    || resource.heuristic_freshness(now) > Duration::ZERO))
    }

    /// Forwards a cacheable request upstream and finishes through
    /// [`complete`](Self::complete).
    async fn pass<S, ReqBody, ResBody>(
        &self,
        upstream: &mut S,
        view: RequestView,
        body: ReqBody,
    ) -> std::result::Result<Response<CacheBody>, BoxError>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>>,
        S::Error: Into<BoxError>,
        ResBody: HttpBody,
        ResBody::Error: Into<BoxError>,
    {
        let request_time = view.received_at;
        let response = upstream
            .call(Request::from_parts(view.parts.clone(), body))
            .await
            .map_err(Into::into)?;
        let captured = Captured::collect(response).await?;
        self.complete(captured, view, request_time).await
    }

    /// Finishes a pass: decides storability, stamps age metadata on the
    /// reply, and schedules the background store.
    async fn complete(
        &self,
        mut captured: Captured,
        view: RequestView,
        request_time: SystemTime,
    ) -> std::result::Result<Response<CacheBody>, BoxError> {
        let response_time = self.now();
        let probe = captured.resource(request_time);
        if !self.is_cacheable_response(&probe, &view, response_time) {
            log::debug!("skipping store for {}", view.key);
            let mut response = captured.into_response(&view.parts.method);
            response.headers_mut().insert(XCACHE, CacheStatus::Skip.header_value());
            return Ok(response);
        }

        // rfc7234 4.2.3; skipped when the origin sent no usable Date
        if let Some(corrected) =
            corrected_age(&captured.parts.headers, request_time, response_time, response_time)
        {
            captured.parts.headers.insert(AGE, HeaderValue::from(ceil_secs(corrected)));
        }
        captured
            .parts
            .headers
            .insert(PROXY_DATE, HeaderValue::from_str(&httpdate::fmt_http_date(response_time))?);

        let mut stored = captured.resource(request_time);
        if self.options.shared {
            stored.remove_private_headers();
        }
        let mut keys = vec![view.key.to_string()];
        if let Some(vary) = stored.header(VARY).map(str::to_owned) {
            keys.push(view.key.vary(&vary, &view.parts.headers).to_string());
        }
        log::debug!("storing {} under {} key(s)", view.key, keys.len());
        self.writer.submit(WriteJob::Store { resource: stored, keys }).await;

        let mut response = captured.into_response(&view.parts.method);
        response.headers_mut().insert(XCACHE, CacheStatus::Miss.header_value());
        Ok(response)
    }

    /// Forwards an uncacheable request without storing. HEAD replies
    /// refresh the stored GET entry; successful state-changing replies
    /// invalidate the affected URLs.
    async fn pipe<S, ReqBody, ResBody>(
        &self,
        upstream: &mut S,
        view: RequestView,
        body: ReqBody,
    ) -> std::result::Result<Response<CacheBody>, BoxError>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>>,
        S::Error: Into<BoxError>,
        ResBody: HttpBody,
        ResBody::Error: Into<BoxError>,
    {
        log::debug!("piping {} {} upstream", view.parts.method, view.url);
        let response = upstream
            .call(Request::from_parts(view.parts.clone(), body))
            .await
            .map_err(Into::into)?;
        let captured = Captured::collect(response).await?;

        let status = captured.parts.status;
        let non_error = status.is_success() || status.is_redirection();

        if non_error && view.parts.method == Method::HEAD {
            // the manager's freshen replaces headers outright, so merge the
            // HEAD reply onto the stored entry before handing it over
            let get_key = view.key.for_method("GET").to_string();
            match self.manager.retrieve(&get_key).await {
                Ok(Some(mut stored)) => {
                    stored.freshen_from(&captured.parts.headers);
                    self.writer
                        .submit(WriteJob::Freshen { resource: stored, key: get_key })
                        .await;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("skipping freshen after HEAD, lookup of {get_key} failed: {err}");
                }
            }
        }

        if non_error && view.is_state_changing() {
            let keys = self.invalidation_keys(&view, &captured);
            log::debug!(
                "invalidating {} key(s) after {} {}",
                keys.len(),
                view.parts.method,
                view.url
            );
            self.writer.submit(WriteJob::Invalidate { keys }).await;
        }

        let mut response = captured.into_response(&view.parts.method);
        response.headers_mut().insert(XCACHE, CacheStatus::Skip.header_value());
        Ok(response)
    }

    /// Keys invalidated by a state-changing response: the request URL plus
    /// any same-host `Location` / `Content-Location` targets.
    fn invalidation_keys(&self, view: &RequestView, captured: &Captured) -> Vec<String> {
        let mut urls = vec![view.url.clone()];
        for name in [LOCATION, CONTENT_LOCATION] {
            if let Some(target) = captured.parts.headers.get(name).and_then(|v| v.to_str().ok()) {
                if let Ok(resolved) = view.url.join(target) {
                    if resolved.host_str() == view.url.host_str() {
                        urls.push(resolved);
                    }
                }
            }
        }
        let mut keys = Vec::with_capacity(urls.len() * 2);
        for url in urls {
            let key = Key::for_url("GET", url, &self.options.rewrites);
            keys.push(key.to_string());
            keys.push(key.for_method("HEAD").to_string());
        }
        keys
    }

    /// Revalidates a stored entry with one conditional round-trip.
    async fn validate<S, ReqBody, ResBody>(
        &self,
        upstream: &mut S,
        view: RequestView,
        body: ReqBody,
        stored: Resource,
    ) -> std::result::Result<Response<CacheBody>, BoxError>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>>,
        S::Error: Into<BoxError>,
        ResBody: HttpBody,
        ResBody::Error: Into<BoxError>,
    {
        let request_time = view.received_at;
        let conditional = validator::conditional_parts(&view.parts, &stored);
        log::debug!("revalidating {} upstream", view.key);
        let response = upstream
            .call(Request::from_parts(conditional, body))
            .await
            .map_err(Into::into)?;

        match validator::classify(response.status()) {
            Validation::NotModified => {
                let response_time = self.now();
                let (fresh_parts, _) = response.into_parts();
                let mut updated = stored;
                updated.freshen_from(&fresh_parts.headers);

                // age restarts from this round-trip, not the original store
                match corrected_age(&updated.headers, request_time, response_time, response_time)
                {
                    Some(corrected) => {
                        updated.headers.insert(AGE, HeaderValue::from(ceil_secs(corrected)));
                    }
                    None => {
                        updated.headers.remove(AGE);
                    }
                }
                updated.headers.insert(
                    PROXY_DATE,
                    HeaderValue::from_str(&httpdate::fmt_http_date(response_time))?,
                );

                let mut keys = vec![view.key.to_string()];
                if let Some(vary) = updated.header(VARY).map(str::to_owned) {
                    keys.push(view.key.vary(&vary, &view.parts.headers).to_string());
                }
                for key in keys {
                    self.writer
                        .submit(WriteJob::Freshen { resource: updated.clone(), key })
                        .await;
                }

                match self.serve(updated, &view) {
                    Ok(response) => Ok(response),
                    Err(err) => {
                        log::error!("serving revalidated {} failed: {err}", view.key);
                        Ok(refuse(StatusCode::INTERNAL_SERVER_ERROR))
                    }
                }
            }
            // the upstream reply supersedes the entry either way; it is
            // stored again only if cacheable on its own terms
            Validation::Superseded | Validation::Failed => {
                let captured = Captured::collect(response).await?;
                self.complete(captured, view, request_time).await
            }
        }
    }

    /// Serves a stored resource downstream.
    fn serve(&self, resource: Resource, view: &RequestView) -> Result<Response<CacheBody>> {
        let now = self.now();
        let age = resource.current_age(now)?;

        let mut headers = resource.headers.clone();

        // rfc7234 5.5.4
        if age > DAY && resource.heuristic_freshness(now) > DAY {
            headers.append(WARNING, HeaderValue::from_static("113 - \"Heuristic Expiration\""));
        }
        // rfc7234 5.5.1
        if self.freshness(&resource, view, now).map_or(true, |freshness| freshness <= 0) {
            headers.append(WARNING, HeaderValue::from_static("110 - \"Response is Stale\""));
        }

        headers.insert(AGE, HeaderValue::from(age.as_secs()));
        headers.append(
            VIA,
            HeaderValue::from_str(&via_value(view.parts.version, &self.options.via_pseudonym))?,
        );
        headers.insert(XCACHE, CacheStatus::Hit.header_value());

        log::debug!("serving {} from cache, age {}s", view.key, age.as_secs());

        if resource.status == StatusCode::OK {
            return serve_content(resource, view, headers);
        }

        let status = resource.status;
        let mut response = Response::new(body_for(&view.parts.method, resource.body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

// zero-length entries exist in the store but never serve
fn live(entry: Option<Resource>) -> Option<Resource> {
    entry.filter(|resource| !resource.body.is_empty())
}

fn body_for(method: &Method, body: bytes::Bytes) -> CacheBody {
    if method == Method::HEAD {
        CacheBody::Empty
    } else {
        CacheBody::Cached(body)
    }
}

fn refuse(status: StatusCode) -> Response<CacheBody> {
    let mut response = Response::new(CacheBody::Empty);
    *response.status_mut() = status;
    response
}

fn refuse_only_if_cached() -> Response<CacheBody> {
    let mut response = refuse(StatusCode::GATEWAY_TIMEOUT);
    response.headers_mut().insert(XCACHE, CacheStatus::Miss.header_value());
    response
}

// rfc7234 4.2.3
fn corrected_age(
    headers: &HeaderMap,
    request_time: SystemTime,
    response_time: SystemTime,
    now: SystemTime,
) -> Option<Duration> {
    let date = headers
        .get(DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())?;
    let apparent_age = response_time.duration_since(date).unwrap_or_default();
    let age_value = headers
        .get(AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();
    let corrected_age_value =
        age_value + response_time.duration_since(request_time).unwrap_or_default();
    let corrected_initial = apparent_age.max(corrected_age_value);
    Some(corrected_initial + now.duration_since(response_time).unwrap_or_default())
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn via_value(version: Version, pseudonym: &str) -> String {
    let protocol = if version == Version::HTTP_10 {
        "1.0"
    } else if version == Version::HTTP_2 {
        "2.0"
    } else if version == Version::HTTP_3 {
        "3.0"
    } else {
        "1.1"
    };
    format!("{protocol} {pseudonym}")
}

// Conditional and range-aware serving of complete cached 200 responses,
// keyed on the stored validators.
fn serve_content(
    resource: Resource,
    view: &RequestView,
    mut headers: HeaderMap,
) -> Result<Response<CacheBody>> {
    if client_not_modified(&view.parts.headers, &resource) {
        headers.remove(CONTENT_LENGTH);
        let mut response = Response::new(CacheBody::Empty);
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        *response.headers_mut() = headers;
        return Ok(response);
    }

    let total = resource.body.len() as u64;
    if let Some(range) = view.parts.headers.get(RANGE).and_then(|v| v.to_str().ok()) {
        if total > 0 {
            match parse_single_range(range, total) {
                RangeOutcome::Satisfiable(start, end) => {
                    let slice = resource.body.slice(start as usize..=end as usize);
                    headers.insert(
                        CONTENT_RANGE,
                        HeaderValue::from_str(&format!("bytes {start}-{end}/{total}"))?,
                    );
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(slice.len() as u64));
                    let mut response = Response::new(body_for(&view.parts.method, slice));
                    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
                    *response.headers_mut() = headers;
                    return Ok(response);
                }
                RangeOutcome::Unsatisfiable => {
                    headers.remove(CONTENT_LENGTH);
                    headers.insert(
                        CONTENT_RANGE,
                        HeaderValue::from_str(&format!("bytes */{total}"))?,
                    );
                    let mut response = Response::new(CacheBody::Empty);
                    *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                    *response.headers_mut() = headers;
                    return Ok(response);
                }
                RangeOutcome::Ignored => {}
            }
        }
    }

    let mut response = Response::new(body_for(&view.parts.method, resource.body));
    *response.headers_mut() = headers;
    Ok(response)
}

fn client_not_modified(req_headers: &HeaderMap, resource: &Resource) -> bool {
    if let Some(if_none_match) = req_headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if let Some(etag) = resource.header(ETAG) {
            return if_none_match == "*"
                || if_none_match.split(',').any(|candidate| candidate.trim() == etag);
        }
        return false;
    }
    if let Some(since) = req_headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        if let Some(modified) = resource.last_modified() {
            return modified <= since;
        }
    }
    false
}

enum RangeOutcome {
    Satisfiable(u64, u64),
    Unsatisfiable,
    // multi-range and syntactically odd specs fall back to the full body
    Ignored,
}

fn parse_single_range(raw: &str, total: u64) -> RangeOutcome {
    let Some(spec) = raw.strip_prefix("bytes=") else {
        return RangeOutcome::Ignored;
    };
    if spec.contains(',') {
        return RangeOutcome::Ignored;
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return RangeOutcome::Ignored;
    };
    if start.is_empty() {
        // suffix form: the last n bytes
        let Ok(suffix) = end.parse::<u64>() else {
            return RangeOutcome::Ignored;
        };
        if suffix == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let len = suffix.min(total);
        return RangeOutcome::Satisfiable(total - len, total - 1);
    }
    let Ok(start) = start.parse::<u64>() else {
        return RangeOutcome::Ignored;
    };
    if start >= total {
        return RangeOutcome::Unsatisfiable;
    }
    let end = if end.is_empty() {
        total - 1
    } else {
        match end.parse::<u64>() {
            Ok(end) => end.min(total - 1),
            Err(_) => return RangeOutcome::Ignored,
        }
    };
    if end < start {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Satisfiable(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderName;

    fn view_for(builder: http::request::Builder) -> RequestView {
        let parts = builder.body(()).unwrap().into_parts().0;
        let url = request_url(&parts).unwrap();
        let control = CacheControl::from_headers(&parts.headers).unwrap();
        let key = Key::for_request(&parts, &url, &[]);
        RequestView { parts, url, key, control, received_at: SystemTime::now() }
    }

    fn resource_with(headers: &[(&str, String)], body: &'static str) -> Resource {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name.parse::<HeaderName>().unwrap(), value.parse().unwrap());
        }
        Resource::new(StatusCode::OK, map, Bytes::from(body), SystemTime::now())
    }

    #[test]
    fn request_cacheability() {
        assert!(view_for(Request::get("https://example.com/a")).is_cacheable());
        assert!(view_for(Request::head("https://example.com/a")).is_cacheable());
        assert!(!view_for(Request::post("https://example.com/a")).is_cacheable());
        assert!(!view_for(
            Request::get("https://example.com/a").header("if-match", "\"v1\"")
        )
        .is_cacheable());
        assert!(!view_for(
            Request::get("https://example.com/a").header("if-range", "\"v1\"")
        )
        .is_cacheable());
        assert!(!view_for(
            Request::get("https://example.com/a")
                .header("if-unmodified-since", "Sat, 01 Jan 2022 00:00:00 GMT")
        )
        .is_cacheable());
        assert!(!view_for(
            Request::get("https://example.com/a").header("cache-control", "no-store")
        )
        .is_cacheable());
        assert!(!view_for(
            Request::get("https://example.com/a").header("cache-control", "no-cache")
        )
        .is_cacheable());
        assert!(!view_for(
            Request::get("https://example.com/a").header("cache-control", "max-age=0")
        )
        .is_cacheable());
        assert!(view_for(
            Request::get("https://example.com/a").header("cache-control", "max-age=10")
        )
        .is_cacheable());
    }

    #[test]
    fn state_changing_methods() {
        assert!(view_for(Request::post("https://example.com/a")).is_state_changing());
        assert!(view_for(Request::put("https://example.com/a")).is_state_changing());
        assert!(view_for(Request::delete("https://example.com/a")).is_state_changing());
        assert!(!view_for(Request::get("https://example.com/a")).is_state_changing());
        assert!(!view_for(Request::head("https://example.com/a")).is_state_changing());
    }

    #[test]
    fn corrected_age_takes_the_larger_estimate() {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        headers.insert(DATE, httpdate::fmt_http_date(now - Duration::from_secs(100)).parse().unwrap());
        headers.insert(AGE, "5".parse().unwrap());
        let corrected =
            corrected_age(&headers, now - Duration::from_secs(10), now, now).unwrap();
        assert_eq!(corrected, Duration::from_secs(100));

        headers.insert(DATE, httpdate::fmt_http_date(now).parse().unwrap());
        let corrected =
            corrected_age(&headers, now - Duration::from_secs(10), now, now).unwrap();
        assert_eq!(corrected, Duration::from_secs(15));
    }

    #[test]
    fn corrected_age_without_date_is_skipped() {
        let now = SystemTime::now();
        assert!(corrected_age(&HeaderMap::new(), now, now, now).is_none());
    }

    #[test]
    fn ceiling_of_seconds() {
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::from_millis(3001)), 4);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }

    #[test]
    fn via_reflects_the_protocol() {
        assert_eq!(via_value(Version::HTTP_11, "gw"), "1.1 gw");
        assert_eq!(via_value(Version::HTTP_10, "gw"), "1.0 gw");
        assert_eq!(via_value(Version::HTTP_2, "gw"), "2.0 gw");
    }

    #[test]
    fn single_ranges() {
        assert!(matches!(parse_single_range("bytes=0-3", 10), RangeOutcome::Satisfiable(0, 3)));
        assert!(matches!(parse_single_range("bytes=4-", 10), RangeOutcome::Satisfiable(4, 9)));
        assert!(matches!(parse_single_range("bytes=-2", 10), RangeOutcome::Satisfiable(8, 9)));
        assert!(matches!(parse_single_range("bytes=0-99", 10), RangeOutcome::Satisfiable(0, 9)));
        assert!(matches!(parse_single_range("bytes=10-", 10), RangeOutcome::Unsatisfiable));
        assert!(matches!(parse_single_range("bytes=-0", 10), RangeOutcome::Unsatisfiable));
        assert!(matches!(parse_single_range("bytes=0-1,3-4", 10), RangeOutcome::Ignored));
        assert!(matches!(parse_single_range("lines=0-1", 10), RangeOutcome::Ignored));
    }

    #[cfg(feature = "manager-moka")]
    mod with_engine {
        use super::*;
        use crate::MokaManager;

        fn engine() -> GatewayCache<MokaManager> {
            GatewayCache::new(MokaManager::default(), GatewayOptions::default())
        }

        fn proxy_dated(
            now: SystemTime,
            extra: &[(&str, String)],
            age_offset: Duration,
        ) -> Resource {
            let mut headers: Vec<(&str, String)> =
                vec![("proxy-date", httpdate::fmt_http_date(now - age_offset))];
            headers.extend(extra.iter().map(|(name, value)| (*name, value.clone())));
            resource_with(&headers, "body")
        }

        #[tokio::test]
        async fn freshness_counts_down_and_goes_negative() {
            let engine = engine();
            let view = view_for(Request::get("https://example.com/a"));
            let now = SystemTime::now();

            let res = proxy_dated(
                now,
                &[("cache-control", "max-age=60".to_string())],
                Duration::from_secs(20),
            );
            assert_eq!(engine.freshness(&res, &view, now).unwrap(), 40);

            let res = proxy_dated(
                now,
                &[("cache-control", "max-age=60".to_string())],
                Duration::from_secs(90),
            );
            assert_eq!(engine.freshness(&res, &view, now).unwrap(), -30);
        }

        #[tokio::test]
        async fn request_max_age_lowers_the_lifetime() {
            let engine = engine();
            let now = SystemTime::now();
            let view = view_for(
                Request::get("https://example.com/a").header("cache-control", "max-age=30"),
            );
            let res = proxy_dated(
                now,
                &[("cache-control", "max-age=600".to_string())],
                Duration::from_secs(10),
            );
            assert_eq!(engine.freshness(&res, &view, now).unwrap(), 20);
        }

        #[tokio::test]
        async fn heuristic_freshness_fills_in_for_missing_max_age() {
            let engine = engine();
            let view = view_for(Request::get("https://example.com/a"));
            let now = SystemTime::now();
            let res = proxy_dated(
                now,
                &[("last-modified", httpdate::fmt_http_date(now - 100 * DAY))],
                Duration::from_secs(3600),
            );
            // a tenth of 100 days, minus one hour of age
            assert_eq!(
                engine.freshness(&res, &view, now).unwrap(),
                (10 * DAY).as_secs() as i64 - 3600
            );
            assert!(!engine.needs_validation(&res, &view, now));
        }

        #[tokio::test]
        async fn past_expires_zeroes_freshness() {
            let engine = engine();
            let view = view_for(Request::get("https://example.com/a"));
            let now = SystemTime::now();
            let res = proxy_dated(
                now,
                &[("expires", httpdate::fmt_http_date(now - Duration::from_secs(60)))],
                Duration::ZERO,
            );
            assert_eq!(engine.freshness(&res, &view, now).unwrap(), 0);
            assert!(engine.needs_validation(&res, &view, now));
        }

        #[tokio::test]
        async fn must_revalidate_always_validates() {
            let engine = engine();
            let view = view_for(Request::get("https://example.com/a"));
            let now = SystemTime::now();
            let res = proxy_dated(
                now,
                &[("cache-control", "max-age=60, must-revalidate".to_string())],
                Duration::ZERO,
            );
            assert!(engine.needs_validation(&res, &view, now));
        }

        #[tokio::test]
        async fn max_stale_excuses_bounded_staleness() {
            let engine = engine();
            let now = SystemTime::now();
            let res = proxy_dated(
                now,
                &[("cache-control", "max-age=60".to_string())],
                Duration::from_secs(90),
            );

            let plain = view_for(Request::get("https://example.com/a"));
            assert!(engine.needs_validation(&res, &plain, now));

            let unlimited = view_for(
                Request::get("https://example.com/a").header("cache-control", "max-stale"),
            );
            assert!(!engine.needs_validation(&res, &unlimited, now));

            let generous = view_for(
                Request::get("https://example.com/a").header("cache-control", "max-stale=60"),
            );
            assert!(!engine.needs_validation(&res, &generous, now));

            let strict = view_for(
                Request::get("https://example.com/a").header("cache-control", "max-stale=10"),
            );
            assert!(engine.needs_validation(&res, &strict, now));
        }

        #[tokio::test]
        async fn min_fresh_demands_remaining_lifetime() {
            let engine = engine();
            let now = SystemTime::now();
            let res = proxy_dated(
                now,
                &[("cache-control", "max-age=60".to_string())],
                Duration::from_secs(30),
            );
            let demanding = view_for(
                Request::get("https://example.com/a").header("cache-control", "min-fresh=45"),
            );
            assert!(engine.needs_validation(&res, &demanding, now));
            let satisfied = view_for(
                Request::get("https://example.com/a").header("cache-control", "min-fresh=15"),
            );
            assert!(!engine.needs_validation(&res, &satisfied, now));
        }

        #[tokio::test]
        async fn response_cacheability_rules() {
            let engine = engine();
            let now = SystemTime::now();
            let view = view_for(Request::get("https://example.com/a"));

            let explicit = resource_with(&[("cache-control", "max-age=60".into())], "x");
            assert!(engine.is_cacheable_response(&explicit, &view, now));

            let no_store = resource_with(&[("cache-control", "no-store".into())], "x");
            assert!(!engine.is_cacheable_response(&no_store, &view, now));

            let private = resource_with(
                &[("cache-control", "private, max-age=60".into())],
                "x",
            );
            assert!(!engine.is_cacheable_response(&private, &view, now));

            let mut error = resource_with(&[("cache-control", "max-age=60".into())], "x");
            error.status = StatusCode::INTERNAL_SERVER_ERROR;
            assert!(!engine.is_cacheable_response(&error, &view, now));

            let validators_only = resource_with(
                &[("last-modified", httpdate::fmt_http_date(now - DAY))],
                "x",
            );
            assert!(engine.is_cacheable_response(&validators_only, &view, now));

            let bare = resource_with(&[], "x");
            assert!(!engine.is_cacheable_response(&bare, &view, now));

            let authorized = view_for(
                Request::get("https://example.com/a").header("authorization", "Bearer t"),
            );
            assert!(!engine.is_cacheable_response(&explicit, &authorized, now));
        }

        #[tokio::test]
        async fn private_is_storable_by_a_private_cache() {
            let engine = GatewayCache::new(
                MokaManager::default(),
                GatewayOptions { shared: false, ..Default::default() },
            );
            let view = view_for(Request::get("https://example.com/a"));
            let private = resource_with(
                &[("cache-control", "private, max-age=60".into())],
                "x",
            );
            assert!(engine.is_cacheable_response(&private, &view, SystemTime::now()));
        }
    }
}
