//! Tower integration.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{Request, Response};
use http_body::Body as HttpBody;
use tower::{Layer, Service};

use crate::body::CacheBody;
use crate::error::BoxError;
use crate::handler::GatewayCache;
use crate::CacheManager;

/// Tower layer that applies the gateway cache to an upstream service.
pub struct CacheLayer<M> {
    cache: GatewayCache<M>,
}

impl<M> Clone for CacheLayer<M> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone() }
    }
}

impl<M: CacheManager> CacheLayer<M> {
    /// Wraps the given engine.
    pub fn new(cache: GatewayCache<M>) -> Self {
        Self { cache }
    }
}

impl<S, M: CacheManager> Layer<S> for CacheLayer<M> {
    type Service = CacheService<S, M>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService { inner, cache: self.cache.clone() }
    }
}

/// Tower service produced by [`CacheLayer`].
pub struct CacheService<S, M> {
    inner: S,
    cache: GatewayCache<M>,
}

impl<S: Clone, M> Clone for CacheService<S, M> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), cache: self.cache.clone() }
    }
}

impl<S, M, ReqBody, ResBody> Service<Request<ReqBody>> for CacheService<S, M>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
    M: CacheManager,
    ReqBody: Send + 'static,
    ResBody: HttpBody + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<CacheBody>;
    type Error = BoxError;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let cache = self.cache.clone();
        // hand the service that reported readiness to the future and keep a
        // fresh clone for the next caller
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { cache.handle(inner, req).await })
    }
}
