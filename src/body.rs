//! Buffered response bodies.
//!
//! The gateway buffers every upstream reply so it can hand the same bytes
//! to the downstream client and to the store. [`Captured`] is that buffer;
//! [`CacheBody`] is the body type all downstream responses share.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use bytes::Bytes;
use http::{response, Method, Response};
use http_body::{Body, Frame};
use http_body_util::BodyExt;

use crate::error::BoxError;
use crate::resource::Resource;

/// Downstream response body.
#[derive(Debug)]
pub enum CacheBody {
    /// Body served from the store.
    Cached(Bytes),
    /// Body forwarded from upstream.
    Fresh(Bytes),
    /// No body: synthesized statuses and HEAD responses.
    Empty,
}

impl Body for CacheBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let bytes = match &mut *self {
            CacheBody::Cached(bytes) | CacheBody::Fresh(bytes) => {
                std::mem::replace(bytes, Bytes::new())
            }
            CacheBody::Empty => Bytes::new(),
        };

        if bytes.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(Ok(Frame::data(bytes))))
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            CacheBody::Cached(bytes) | CacheBody::Fresh(bytes) => bytes.is_empty(),
            CacheBody::Empty => true,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            CacheBody::Cached(bytes) | CacheBody::Fresh(bytes) => {
                http_body::SizeHint::with_exact(bytes.len() as u64)
            }
            CacheBody::Empty => http_body::SizeHint::with_exact(0),
        }
    }
}

/// An upstream reply captured in memory, feeding both the downstream
/// response and the stored resource.
#[derive(Debug)]
pub(crate) struct Captured {
    pub(crate) parts: response::Parts,
    pub(crate) body: Bytes,
}

impl Captured {
    /// Buffers the upstream response.
    pub(crate) async fn collect<B>(response: Response<B>) -> std::result::Result<Self, BoxError>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = response.into_parts();
        let body = body.collect().await.map_err(Into::into)?.to_bytes();
        Ok(Self { parts, body })
    }

    /// Builds the stored-response view of the capture. The body handle is
    /// shared, not copied.
    pub(crate) fn resource(&self, request_time: SystemTime) -> Resource {
        Resource::new(
            self.parts.status,
            self.parts.headers.clone(),
            self.body.clone(),
            request_time,
        )
    }

    /// Re-emits the capture downstream. HEAD responses drop the body.
    pub(crate) fn into_response(self, method: &Method) -> Response<CacheBody> {
        let body = if method == Method::HEAD {
            CacheBody::Empty
        } else {
            CacheBody::Fresh(self.body)
        };
        Response::from_parts(self.parts, body)
    }
}
