//! Header copy rules between the client and destination sides.
//!
//! # Design Decisions
//! - Exclusions are process-wide constants; nothing mutates them at runtime
//! - Names are compared case-insensitively (`HeaderName` is already lowercase)
//! - Pseudo-headers (`:authority`, `:path`) never reach a `HeaderMap`; hyper maps
//!   them onto the URI and method, so they cannot be copied
//! - Distributed-tracing headers are dropped by default so the proxy's own
//!   tracing can restart the trace context

use axum::http::header::{self, HeaderMap, HeaderName};

const PROXY_PREFIX: &str = "proxy-";

/// Hop-by-hop and connection-specific headers never copied in either direction.
pub static HEADERS_TO_EXCLUDE: [HeaderName; 12] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    HeaderName::from_static("keep-alive"),
    header::UPGRADE,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("proxy-authenticate"),
    HeaderName::from_static("proxy-authentication-info"),
    HeaderName::from_static("proxy-authorization"),
    HeaderName::from_static("proxy-features"),
    HeaderName::from_static("proxy-instruction"),
    HeaderName::from_static("security-scheme"),
    HeaderName::from_static("alpn"),
];

/// Further headers that only make sense on one hop.
pub static CONNECTION_SPECIFIC_HEADERS: [HeaderName; 5] = [
    HeaderName::from_static("close"),
    HeaderName::from_static("http2-settings"),
    header::UPGRADE_INSECURE_REQUESTS,
    header::TE,
    HeaderName::from_static("alt-svc"),
];

/// Distributed-tracing headers.
pub static TRACING_HEADERS: [HeaderName; 5] = [
    HeaderName::from_static("traceparent"),
    HeaderName::from_static("tracestate"),
    HeaderName::from_static("baggage"),
    HeaderName::from_static("request-id"),
    HeaderName::from_static("correlation-context"),
];

/// True when `name` must not cross the proxy.
pub fn is_excluded(name: &HeaderName, skip_tracing_headers: bool) -> bool {
    name.as_str().starts_with(PROXY_PREFIX)
        || HEADERS_TO_EXCLUDE.contains(name)
        || CONNECTION_SPECIFIC_HEADERS.contains(name)
        || (skip_tracing_headers && TRACING_HEADERS.contains(name))
}

/// `TE: trailers` is the one `TE` value worth forwarding (gRPC relies on it).
fn is_te_trailers(source: &HeaderMap) -> bool {
    source
        .get_all(header::TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("trailers"))
}

fn has_transfer_encoding(source: &HeaderMap) -> bool {
    source.contains_key(header::TRANSFER_ENCODING)
}

/// Copy client request headers onto an outbound request.
///
/// `Host` is left for the send primitive to fill from the destination URI.
pub fn copy_request_headers(source: &HeaderMap, target: &mut HeaderMap, skip_tracing_headers: bool) {
    let drop_content_length = has_transfer_encoding(source);

    for (name, value) in source {
        if *name == header::HOST
            || is_excluded(name, skip_tracing_headers)
            || (drop_content_length && *name == header::CONTENT_LENGTH)
        {
            continue;
        }
        target.append(name.clone(), value.clone());
    }

    if is_te_trailers(source) {
        target.insert(header::TE, header::HeaderValue::from_static("trailers"));
    }
}

/// Copy destination response headers onto the client response.
pub fn copy_response_headers(source: &HeaderMap, target: &mut HeaderMap, skip_tracing_headers: bool) {
    let drop_content_length = has_transfer_encoding(source);

    for (name, value) in source {
        if is_excluded(name, skip_tracing_headers)
            || (drop_content_length && *name == header::CONTENT_LENGTH)
        {
            continue;
        }
        target.append(name.clone(), value.clone());
    }
}

/// Copy destination trailers onto the client response trailers.
pub fn copy_trailers(source: &HeaderMap, target: &mut HeaderMap, skip_tracing_headers: bool) {
    for (name, value) in source {
        if is_excluded(name, skip_tracing_headers) {
            continue;
        }
        target.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn hop_by_hop_headers_are_not_forwarded() {
        let source = map(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("proxy-authorization", "Basic x"),
            ("proxy-anything", "x"),
            ("http2-settings", "AAMAAABkAAQAAP__"),
            ("upgrade-insecure-requests", "1"),
            ("alt-svc", "h3=\":443\""),
            ("te", "gzip"),
            ("traceparent", "00-abc-def-01"),
            ("baggage", "k=v"),
            ("tracestate", "vendor=1"),
            ("correlation-context", "k=v"),
            ("close", "1"),
            ("security-scheme", "x"),
            ("alpn", "h2"),
            ("proxy-connection", "keep-alive"),
            ("host", "client.example"),
            ("x-custom", "kept"),
            ("accept", "*/*"),
        ]);
        let mut target = HeaderMap::new();
        copy_request_headers(&source, &mut target, true);

        let names: Vec<_> = target.keys().map(|k| k.as_str()).collect();
        assert_eq!(names.len(), 2, "{names:?}");
        assert_eq!(target["x-custom"], "kept");
        assert_eq!(target["accept"], "*/*");

        // Pseudo-headers cannot be carried by a HeaderMap at all.
        assert!(HeaderName::from_bytes(b":authority").is_err());
    }

    #[test]
    fn tracing_headers_pass_when_not_skipped() {
        let source = map(&[("traceparent", "00-abc-def-01"), ("request-id", "r1")]);
        let mut target = HeaderMap::new();
        copy_request_headers(&source, &mut target, false);
        assert_eq!(target["traceparent"], "00-abc-def-01");
        assert_eq!(target["request-id"], "r1");
    }

    #[test]
    fn te_trailers_is_kept() {
        let source = map(&[("te", "trailers")]);
        let mut target = HeaderMap::new();
        copy_request_headers(&source, &mut target, true);
        assert_eq!(target[header::TE], "trailers");
    }

    #[test]
    fn transfer_encoding_overrides_content_length() {
        let source = map(&[("transfer-encoding", "chunked"), ("content-length", "10")]);
        let mut target = HeaderMap::new();
        copy_request_headers(&source, &mut target, true);
        assert!(target.is_empty());

        let mut target = HeaderMap::new();
        copy_response_headers(&source, &mut target, true);
        assert!(target.is_empty());

        let source = map(&[("content-length", "10")]);
        let mut target = HeaderMap::new();
        copy_response_headers(&source, &mut target, true);
        assert_eq!(target[header::CONTENT_LENGTH], "10");
    }

    #[test]
    fn multi_valued_headers_are_preserved() {
        let source = map(&[("set-cookie", "a=1"), ("set-cookie", "b=2")]);
        let mut target = HeaderMap::new();
        copy_response_headers(&source, &mut target, true);
        let cookies: Vec<_> = target.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
    }
}
