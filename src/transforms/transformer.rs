//! Request/response transform hooks.

use axum::body::Body;
use axum::http::{Extensions, HeaderMap, Method, Request, Response, Uri, Version};
use futures_util::future::BoxFuture;

use crate::forwarder::BoxError;
use crate::http::HttpContext;
use crate::transforms::headers::{copy_request_headers, copy_response_headers, copy_trailers};

/// Outbound request head, before a body is attached.
///
/// `uri` stays `None` unless a transform sets it; the forwarder then builds one
/// from the destination prefix and the inbound path and query.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Option<Uri>,
    pub version: Version,
    pub headers: HeaderMap,
    pub extensions: Extensions,
}

impl ProxyRequest {
    pub fn new(method: Method, version: Version) -> Self {
        Self {
            method,
            uri: None,
            version,
            headers: HeaderMap::new(),
            extensions: Extensions::new(),
        }
    }

    /// Attach `body` and produce the request handed to the send primitive.
    pub fn into_request(self, uri: Uri, body: Body) -> Request<Body> {
        let mut request = Request::new(body);
        *request.method_mut() = self.method;
        *request.uri_mut() = uri;
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers;
        *request.extensions_mut() = self.extensions;
        request
    }
}

/// Hooks the forwarder calls at each stage.
///
/// Every hook has a default that performs the standard header copy, so
/// implementations override only what they change. A hook failure is a forwarding
/// failure: request transform errors become `RequestCreation`, response transform
/// errors become `ResponseHeaders`.
pub trait HttpTransformer: Send + Sync {
    /// Shape the outbound request. Setting a non-default client response status
    /// here short-circuits forwarding.
    fn transform_request<'a>(
        &'a self,
        context: &'a mut HttpContext,
        proxy_request: &'a mut ProxyRequest,
        destination_prefix: &'a str,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        let _ = destination_prefix;
        Box::pin(async move {
            copy_request_headers(&context.request.headers, &mut proxy_request.headers, true);
            Ok(())
        })
    }

    /// Shape the client response from the destination response. `None` means the
    /// destination never answered. Returns whether the body should be copied.
    fn transform_response<'a>(
        &'a self,
        context: &'a mut HttpContext,
        proxy_response: Option<&'a mut Response<Body>>,
    ) -> BoxFuture<'a, Result<bool, BoxError>> {
        Box::pin(async move {
            let Some(response) = proxy_response else {
                return Ok(false);
            };
            copy_response_headers(response.headers(), context.response.headers_mut(), true);
            Ok(true)
        })
    }

    /// Copy destination trailers to the client response.
    fn transform_response_trailers<'a>(
        &'a self,
        context: &'a mut HttpContext,
        trailers: Option<&'a HeaderMap>,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            if let Some(trailers) = trailers {
                copy_trailers(trailers, context.response.trailers_mut(), true);
            }
            Ok(())
        })
    }
}

/// Transformer with only the standard behaviour.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransformer;

impl HttpTransformer for DefaultTransformer {}

/// Standard behaviour with configurable tracing-header handling.
#[derive(Debug, Clone, Copy)]
pub struct HeaderTransformer {
    pub skip_tracing_headers: bool,
}

impl Default for HeaderTransformer {
    fn default() -> Self {
        Self {
            skip_tracing_headers: true,
        }
    }
}

impl HttpTransformer for HeaderTransformer {
    fn transform_request<'a>(
        &'a self,
        context: &'a mut HttpContext,
        proxy_request: &'a mut ProxyRequest,
        _destination_prefix: &'a str,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            copy_request_headers(
                &context.request.headers,
                &mut proxy_request.headers,
                self.skip_tracing_headers,
            );
            Ok(())
        })
    }

    fn transform_response<'a>(
        &'a self,
        context: &'a mut HttpContext,
        proxy_response: Option<&'a mut Response<Body>>,
    ) -> BoxFuture<'a, Result<bool, BoxError>> {
        Box::pin(async move {
            let Some(response) = proxy_response else {
                return Ok(false);
            };
            copy_response_headers(
                response.headers(),
                context.response.headers_mut(),
                self.skip_tracing_headers,
            );
            Ok(true)
        })
    }

    fn transform_response_trailers<'a>(
        &'a self,
        context: &'a mut HttpContext,
        trailers: Option<&'a HeaderMap>,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            if let Some(trailers) = trailers {
                copy_trailers(trailers, context.response.trailers_mut(), self.skip_tracing_headers);
            }
            Ok(())
        })
    }
}
