//! Request content classification.
//!
//! # Responsibilities
//! - Detect gRPC-like content types
//! - Decide whether a request is a streaming request (auto-flush, relaxed limits)
//! - Decide whether an inbound request carries a body at all

use axum::http::{header, HeaderMap, Method, Version};

use crate::protocol::version::is_http2_or_greater;

const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// `application/grpc`, optionally followed by `+format` or parameters.
pub fn is_grpc_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };

    let prefix_len = GRPC_CONTENT_TYPE.len();
    if content_type.len() < prefix_len
        || !content_type.as_bytes()[..prefix_len].eq_ignore_ascii_case(GRPC_CONTENT_TYPE.as_bytes())
    {
        return false;
    }

    matches!(content_type.as_bytes().get(prefix_len), None | Some(b'+') | Some(b';'))
}

/// HTTP/2+ request carrying a gRPC-like content type.
pub fn is_streaming_request(version: Version, headers: &HeaderMap) -> bool {
    is_http2_or_greater(version)
        && is_grpc_content_type(
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        )
}

/// Decide whether a request body should be attached to the outbound request.
///
/// `detected` is the server's own knowledge (for hyper: the inbound body is not
/// already at end of stream). Without it the decision falls back to framing headers,
/// then protocol, then method.
pub fn request_has_body(
    method: &Method,
    version: Version,
    headers: &HeaderMap,
    detected: Option<bool>,
) -> bool {
    if let Some(detected) = detected {
        return detected;
    }

    // Transfer-Encoding overrides Content-Length.
    let mut transfer_encodings = headers.get_all(header::TRANSFER_ENCODING).iter();
    if let (Some(te), None) = (transfer_encodings.next(), transfer_encodings.next()) {
        if te.as_bytes().eq_ignore_ascii_case(b"chunked") {
            return true;
        }
    }

    if let Some(content_length) = content_length(headers) {
        return content_length > 0;
    }

    // HTTP/1.x requests without framing headers have no body.
    if !is_http2_or_greater(version) {
        return false;
    }

    !(*method == Method::GET
        || *method == Method::HEAD
        || *method == Method::DELETE
        || *method == Method::CONNECT
        || *method == Method::TRACE)
}

/// Parsed `Content-Length`, if present and well-formed.
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn grpc_content_types() {
        assert!(is_grpc_content_type(Some("application/grpc")));
        assert!(is_grpc_content_type(Some("APPLICATION/GRPC")));
        assert!(is_grpc_content_type(Some("application/grpc+proto")));
        assert!(is_grpc_content_type(Some("application/grpc;charset=utf-8")));
        assert!(!is_grpc_content_type(Some("application/grpc-web")));
        assert!(!is_grpc_content_type(Some("application/json")));
        assert!(!is_grpc_content_type(Some("application/grp")));
        assert!(!is_grpc_content_type(None));
    }

    #[test]
    fn streaming_requires_http2() {
        let map = headers(&[("content-type", "application/grpc")]);
        assert!(is_streaming_request(Version::HTTP_2, &map));
        assert!(!is_streaming_request(Version::HTTP_11, &map));
    }

    #[test]
    fn detection_feature_wins() {
        let map = headers(&[("content-length", "10")]);
        assert!(!request_has_body(&Method::POST, Version::HTTP_11, &map, Some(false)));
        assert!(request_has_body(&Method::GET, Version::HTTP_11, &HeaderMap::new(), Some(true)));
    }

    #[test]
    fn chunked_forces_body() {
        let map = headers(&[("transfer-encoding", "Chunked"), ("content-length", "0")]);
        assert!(request_has_body(&Method::GET, Version::HTTP_11, &map, None));
    }

    #[test]
    fn content_length_decides() {
        let map = headers(&[("content-length", "0")]);
        assert!(!request_has_body(&Method::POST, Version::HTTP_2, &map, None));
        let map = headers(&[("content-length", "12")]);
        assert!(request_has_body(&Method::GET, Version::HTTP_11, &map, None));
    }

    #[test]
    fn http1_without_framing_has_no_body() {
        assert!(!request_has_body(&Method::POST, Version::HTTP_11, &HeaderMap::new(), None));
    }

    #[test]
    fn http2_falls_back_to_method() {
        let empty = HeaderMap::new();
        assert!(request_has_body(&Method::POST, Version::HTTP_2, &empty, None));
        assert!(request_has_body(&Method::PUT, Version::HTTP_2, &empty, None));
        for method in [Method::GET, Method::HEAD, Method::DELETE, Method::CONNECT, Method::TRACE] {
            assert!(!request_has_body(&method, Version::HTTP_2, &empty, None));
        }
    }
}
