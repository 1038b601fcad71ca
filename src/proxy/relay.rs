//! Streaming of upstream responses back to clients.
//!
//! The upstream body is passed through frame by frame. hyper only polls
//! the body when the client socket can take more data, so a slow client
//! stops upstream reads instead of growing a buffer.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::{Response, StatusCode};
use tokio_util::sync::DropGuard;

use super::forwarder::Upstream;
use crate::error::ProxyError;

/// Body type returned to clients for every response.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Shared count of body bytes relayed to the client.
#[derive(Debug, Clone, Default)]
pub struct Transferred(Arc<AtomicU64>);

impl Transferred {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Wraps an upstream body for relaying.
///
/// Counts data bytes and reports upstream failures mid-stream. Dropped
/// before the end of the stream (client went away or the connection was
/// force-closed), it cancels the upstream connection.
///
/// hyper stops polling once `is_end_stream` holds, so completion is
/// detected from the inner body rather than from a trailing `None`.
pub struct RelayBody<B: Body> {
    inner: Pin<Box<B>>,
    transferred: Transferred,
    upstream: String,
    finished: bool,
    guard: Option<DropGuard>,
}

impl<B: Body> RelayBody<B> {
    pub fn new(
        inner: B,
        transferred: Transferred,
        upstream: String,
        guard: Option<DropGuard>,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            transferred,
            upstream,
            finished: false,
            guard,
        }
    }

    /// Marks the relay complete and releases the upstream connection
    /// without cancelling it.
    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        tracing::info!(
            upstream = %self.upstream,
            bytes = self.transferred.get(),
            "relay complete"
        );
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.transferred.add(data.len());
                }
                if this.inner.is_end_stream() {
                    this.complete();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                tracing::warn!(
                    upstream = %this.upstream,
                    bytes = this.transferred.get(),
                    error = %e,
                    "upstream failed mid-stream, aborting relay"
                );
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for RelayBody<B> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Empty bodies (HEAD, 204, 304) are never polled.
        if self.inner.is_end_stream() {
            self.complete();
            return;
        }
        tracing::debug!(
            upstream = %self.upstream,
            bytes = self.transferred.get(),
            "client disconnected before relay completed, cancelling upstream"
        );
    }
}

/// Turns a pending upstream response into the client response.
///
/// Status and headers are copied verbatim except that a `Content-Length`
/// sent alongside `Transfer-Encoding` is dropped.
pub fn relay(upstream: Upstream) -> (Response<ProxyBody>, Transferred) {
    let Upstream {
        response,
        target,
        guard,
    } = upstream;
    let (mut parts, body) = response.into_parts();
    strip_conflicting_length(&mut parts.headers);

    let transferred = Transferred::default();
    let body = RelayBody::new(body, transferred.clone(), target.authority(), Some(guard));
    (
        Response::from_parts(parts, body.boxed_unsync()),
        transferred,
    )
}

/// Removes `Content-Length` when the body is re-framed as chunked.
pub fn strip_conflicting_length(headers: &mut HeaderMap) {
    if headers.contains_key(TRANSFER_ENCODING) {
        headers.remove(CONTENT_LENGTH);
    }
}

/// Wraps a full byte payload into the proxy body type.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Builds a JSON response with the given status.
pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Builds the client-facing response for a proxy error.
///
/// The body is a short description; internal addresses never leak.
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    json_response(
        err.status(),
        &serde_json::json!({ "error": err.client_message() }),
    )
}
