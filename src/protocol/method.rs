//! Request method mapping.

use axum::http::Method;
use thiserror::Error;

/// Methods recognised case-insensitively and mapped to their canonical form.
const KNOWN_METHODS: [Method; 8] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::HEAD,
    Method::PATCH,
    Method::TRACE,
];

/// Errors raised while mapping an inbound method.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MethodError {
    /// The method is valid HTTP but cannot be forwarded.
    #[error("unsupported request method '{0}'")]
    Unsupported(String),

    /// The method is not a valid HTTP token.
    #[error("invalid request method '{0}'")]
    InvalidFormat(String),
}

/// Map an inbound method string to the method used on the outbound request.
///
/// Well-known methods are canonicalised regardless of case. `CONNECT` is rejected:
/// tunnelling is not something a request forwarder does. Anything else must be a
/// valid token and is passed through verbatim.
pub fn get_http_method(method: &str) -> Result<Method, MethodError> {
    if let Some(known) = KNOWN_METHODS
        .iter()
        .find(|known| known.as_str().eq_ignore_ascii_case(method))
    {
        return Ok(known.clone());
    }

    if method.eq_ignore_ascii_case(Method::CONNECT.as_str()) {
        return Err(MethodError::Unsupported(method.to_string()));
    }

    Method::from_bytes(method.as_bytes()).map_err(|_| MethodError::InvalidFormat(method.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_are_canonicalised() {
        assert_eq!(get_http_method("get").unwrap(), Method::GET);
        assert_eq!(get_http_method("Post").unwrap(), Method::POST);
        assert_eq!(get_http_method("PUT").unwrap(), Method::PUT);
        assert_eq!(get_http_method("delete").unwrap(), Method::DELETE);
        assert_eq!(get_http_method("oPtIoNs").unwrap(), Method::OPTIONS);
        assert_eq!(get_http_method("head").unwrap(), Method::HEAD);
        assert_eq!(get_http_method("patch").unwrap(), Method::PATCH);
        assert_eq!(get_http_method("trace").unwrap(), Method::TRACE);
    }

    #[test]
    fn connect_is_rejected() {
        assert_eq!(
            get_http_method("CONNECT"),
            Err(MethodError::Unsupported("CONNECT".into()))
        );
        assert!(matches!(get_http_method("connect"), Err(MethodError::Unsupported(_))));
    }

    #[test]
    fn unknown_tokens_pass_through() {
        let method = get_http_method("Purge").unwrap();
        assert_eq!(method.as_str(), "Purge");

        let method = get_http_method("PROPFIND").unwrap();
        assert_eq!(method.as_str(), "PROPFIND");
    }

    #[test]
    fn malformed_tokens_fail_validation() {
        for bad in ["", "GET ", "PO ST", "FOO\t", "B@D(", "a\nb"] {
            assert!(
                matches!(get_http_method(bad), Err(MethodError::InvalidFormat(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }
}
