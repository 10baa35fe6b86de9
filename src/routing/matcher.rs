//! Route matching logic.
//!
//! # Responsibilities
//! - Match host (exact, case-insensitive, port ignored)
//! - Match path prefix (case-sensitive, on segment boundaries)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host comes from the `Host` header, or the URI authority for HTTP/2
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use axum::http::{header, Request};

/// Match conditions of one route.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    host: Option<String>,
    path_prefix: Option<String>,
}

impl RouteMatcher {
    /// Hosts are normalized to lowercase; a trailing '/' on the prefix is ignored.
    pub fn new(host: Option<&str>, path_prefix: Option<&str>) -> Self {
        Self {
            host: host.map(|h| h.to_ascii_lowercase()),
            path_prefix: path_prefix
                .map(|p| p.trim_end_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    pub fn matches<B>(&self, req: &Request<B>) -> bool {
        self.matches_host(request_host(req)) && self.matches_path(req.uri().path())
    }

    fn matches_host(&self, host: Option<&str>) -> bool {
        match (&self.host, host) {
            (None, _) => true,
            (Some(expected), Some(host)) => strip_port(host).eq_ignore_ascii_case(expected),
            (Some(_), None) => false,
        }
    }

    fn matches_path(&self, path: &str) -> bool {
        let Some(prefix) = &self.path_prefix else {
            return true;
        };
        match path.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons.
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(host: Option<&str>, uri: &str) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("Host", host);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn host_is_case_insensitive_and_port_agnostic() {
        let matcher = RouteMatcher::new(Some("Example.com"), None);
        assert!(matcher.matches(&request(Some("example.com"), "/")));
        assert!(matcher.matches(&request(Some("EXAMPLE.COM:8080"), "/")));
        assert!(!matcher.matches(&request(Some("other.com"), "/")));
        assert!(!matcher.matches(&request(None, "/")));
        assert!(matcher.matches(&request(None, "http://example.com/x")));
    }

    #[test]
    fn path_prefix_respects_segments() {
        let matcher = RouteMatcher::new(None, Some("/api/"));
        assert!(matcher.matches(&request(None, "/api")));
        assert!(matcher.matches(&request(None, "/api/v1")));
        assert!(!matcher.matches(&request(None, "/apis")));
        assert!(!matcher.matches(&request(None, "/API/v1")));
    }

    #[test]
    fn empty_conditions_match_everything() {
        let matcher = RouteMatcher::new(None, Some("/"));
        assert!(matcher.matches(&request(Some("any"), "/whatever")));
    }

    #[test]
    fn ipv6_hosts_keep_brackets() {
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("localhost:80"), "localhost");
    }
}
