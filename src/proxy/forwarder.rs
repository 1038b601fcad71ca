//! Request forwarding to upstream targets.
//!
//! Every forwarded request opens a fresh upstream connection. The inbound
//! body is handed to hyper as-is, so it is streamed upstream frame by frame
//! as it arrives from the client rather than buffered.

use std::time::Duration;

use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::router::{Route, Target};
use crate::error::{ProxyError, Result};

/// Boxed error accepted from request bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound on connect + request + upstream response headers.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A pending upstream response.
///
/// Holds the guard that keeps the upstream connection alive. Dropping it
/// (together with the body) cancels the connection task.
pub struct Upstream {
    pub response: Response<Incoming>,
    pub target: Target,
    pub(crate) guard: DropGuard,
}

/// Forwards requests to upstream targets.
///
/// Stateless per invocation; safe to share across connections.
#[derive(Debug, Clone)]
pub struct Forwarder {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Forwarder {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Forwards a request along `route` and waits for the response headers.
    ///
    /// The response body is not read; hand the result to the relay.
    pub async fn forward<B>(&self, route: &Route, request: Request<B>) -> Result<Upstream>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let target = route.target.clone();
        let request = build_upstream_request(route, request)?;

        let exchange = async {
            let stream = connect(&target, self.connect_timeout).await?;
            send(&target, stream, request).await
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok((response, guard))) => Ok(Upstream {
                response,
                target,
                guard,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::UpstreamTimeout {
                upstream: target.authority(),
                phase: "response",
            }),
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }
}

/// Translates an inbound request into the request sent upstream.
///
/// The path is rewritten per the route, `Host` is replaced with the
/// upstream authority and every other header is copied verbatim.
pub fn build_upstream_request<B>(route: &Route, request: Request<B>) -> Result<Request<B>> {
    let (mut parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let rewritten = route.rewrite(path_and_query);
    parts.uri = rewritten
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidRequest(format!("bad upstream uri '{rewritten}': {e}")))?;

    let authority = route.target.authority();
    let host = HeaderValue::from_str(&authority)
        .map_err(|e| ProxyError::InvalidRequest(format!("bad host header '{authority}': {e}")))?;
    parts.headers.insert(HOST, host);
    parts.version = Version::HTTP_11;

    Ok(Request::from_parts(parts, body))
}

/// Opens a TCP connection to `target`, bounded by `timeout`.
pub(crate) async fn connect(target: &Target, timeout: Duration) -> Result<TcpStream> {
    let connecting = TcpStream::connect((target.host.as_str(), target.port));
    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(ProxyError::UpstreamConnectionRefused {
            upstream: target.authority(),
            source,
        }),
        Err(_) => Err(ProxyError::UpstreamTimeout {
            upstream: target.authority(),
            phase: "connect",
        }),
    }
}

/// Runs an HTTP/1.1 exchange over `stream` up to the response headers.
///
/// The connection driver runs in its own task until the connection ends or
/// the returned guard is dropped.
pub(crate) async fn send<B>(
    target: &Target,
    stream: TcpStream,
    request: Request<B>,
) -> Result<(Response<Incoming>, DropGuard)>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let upstream = target.authority();
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| classify(&upstream, e))?;

    let cancel = CancellationToken::new();
    let conn_cancel = cancel.clone();
    let conn_upstream = upstream.clone();
    tokio::spawn(async move {
        tokio::select! {
            res = conn => {
                if let Err(e) = res {
                    tracing::debug!(upstream = %conn_upstream, error = %e, "upstream connection error");
                }
            }
            _ = conn_cancel.cancelled() => {
                tracing::debug!(upstream = %conn_upstream, "upstream connection cancelled");
            }
        }
    });
    let guard = cancel.drop_guard();

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| classify(&upstream, e))?;

    Ok((response, guard))
}

/// Maps a hyper client error onto the proxy taxonomy.
fn classify(upstream: &str, err: hyper::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout {
            upstream: upstream.to_string(),
            phase: "response",
        }
    } else {
        ProxyError::UpstreamConnectionReset {
            upstream: upstream.to_string(),
            reason: err.to_string(),
        }
    }
}
