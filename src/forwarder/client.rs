//! Outbound send primitive.
//!
//! # Responsibilities
//! - Abstract "send this request, give me the response head" behind a trait
//! - Provide the hyper client used in production
//! - Apply the request's `HttpVersionPolicy` against what the pooled
//!   connections can speak
//!
//! # Design Decisions
//! - The forwarder owns retries (it does none); the pooled client must not
//!   replay a request whose body may already have been consumed
//! - Response bodies are boxed into `axum::body::Body` so the forwarder sees one type
//! - Cleartext connections speak HTTP/1.x, or HTTP/2 with prior knowledge when the
//!   client is built `http2_only`; there is no ALPN to negotiate anything else

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, Version};
use futures_util::future::BoxFuture;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use thiserror::Error;

use crate::config::ClientConfig;
use crate::forwarder::BoxError;
use crate::protocol::HttpVersionPolicy;

/// Sends one outbound request and resolves with the response head.
///
/// The response body streams afterwards. Implementations must not retry.
pub trait ForwarderHttpClient: Send + Sync {
    fn send(&self, request: Request<Body>) -> BoxFuture<'_, Result<Response<Body>, BoxError>>;
}

/// The requested version is out of reach under the request's policy.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("HTTP version {requested:?} is not available ({policy:?}, connections speak up to {available:?})")]
pub struct UnsupportedVersion {
    pub requested: Version,
    pub available: Version,
    pub policy: HttpVersionPolicy,
}

/// Pick the version to send with, given what the connections speak.
pub fn negotiate_version(
    requested: Version,
    policy: HttpVersionPolicy,
    http2_only: bool,
) -> Result<Version, UnsupportedVersion> {
    let available = if http2_only { Version::HTTP_2 } else { Version::HTTP_11 };
    let supported = if http2_only {
        requested == Version::HTTP_2
    } else {
        requested == Version::HTTP_10 || requested == Version::HTTP_11
    };
    if supported {
        return Ok(requested);
    }

    match policy {
        HttpVersionPolicy::RequestVersionOrLower if available < requested => Ok(available),
        HttpVersionPolicy::RequestVersionOrHigher if available > requested => Ok(available),
        _ => Err(UnsupportedVersion {
            requested,
            available,
            policy,
        }),
    }
}

/// Pooled hyper client that honours the version policy extension.
#[derive(Clone)]
pub struct PooledHttpClient<C = HttpConnector> {
    inner: Client<C, Body>,
    http2_only: bool,
}

impl<C> PooledHttpClient<C> {
    pub fn new(inner: Client<C, Body>, http2_only: bool) -> Self {
        Self { inner, http2_only }
    }
}

impl<C> ForwarderHttpClient for PooledHttpClient<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    fn send(&self, mut request: Request<Body>) -> BoxFuture<'_, Result<Response<Body>, BoxError>> {
        let policy = request
            .extensions()
            .get::<HttpVersionPolicy>()
            .copied()
            .unwrap_or_default();
        let version = match negotiate_version(request.version(), policy, self.http2_only) {
            Ok(version) => version,
            Err(error) => return Box::pin(async move { Err::<Response<Body>, _>(BoxError::from(error)) }),
        };
        if version != request.version() {
            tracing::debug!(
                requested = ?request.version(),
                version = ?version,
                "Outbound request version adjusted by policy"
            );
            *request.version_mut() = version;
        }

        let response = self.inner.request(request);
        Box::pin(async move {
            let response = response.await?;
            Ok(response.map(Body::new))
        })
    }
}

/// Build the pooled HTTP/1.1 (or HTTP/2 only) client used by the host.
pub fn build_http_client(config: &ClientConfig) -> PooledHttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
    connector.set_nodelay(true);

    let mut builder = Client::builder(TokioExecutor::new());
    builder
        .timer(TokioTimer::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .retry_canceled_requests(false)
        .http2_only(config.http2_only);

    PooledHttpClient::new(builder.build(connector), config.http2_only)
}
