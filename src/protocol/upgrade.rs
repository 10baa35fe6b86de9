//! Upgrade request detection.

use axum::http::{header, HeaderMap, Version};

use crate::protocol::version::is_http2_or_greater;

/// Upgrade tokens the forwarder treats as real upgrades.
///
/// Some servers mark every HTTP/1.1 request as upgradable, so the `Upgrade`
/// header value itself is checked as well.
pub fn is_upgrade_token(value: &[u8]) -> bool {
    value.eq_ignore_ascii_case(b"websocket") || value.starts_with(b"SPDY/")
}

/// True when an HTTP/1.x request asks to switch protocols.
///
/// `upgradable` is the server's own view of the connection (hyper exposes it as an
/// `OnUpgrade` extension on the request).
pub fn is_upgrade_request(version: Version, headers: &HeaderMap, upgradable: bool) -> bool {
    if !upgradable || is_http2_or_greater(version) {
        return false;
    }

    headers
        .get(header::UPGRADE)
        .is_some_and(|v| is_upgrade_token(v.as_bytes()))
}

/// Copy `Connection` and `Upgrade` from `source` into `target`.
///
/// The default header copy strips both; upgrades need them back.
pub fn restore_upgrade_headers(source: &HeaderMap, target: &mut HeaderMap) {
    for name in [header::CONNECTION, header::UPGRADE] {
        let mut values = source.get_all(&name).iter().peekable();
        if values.peek().is_none() {
            continue;
        }
        target.remove(&name);
        for value in values {
            target.append(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn websocket_and_spdy_are_upgrades() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade_request(Version::HTTP_11, &headers, true));

        headers.insert(header::UPGRADE, HeaderValue::from_static("SPDY/3.1"));
        assert!(is_upgrade_request(Version::HTTP_11, &headers, true));
    }

    #[test]
    fn other_tokens_and_h2_are_not() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_upgrade_request(Version::HTTP_11, &headers, true));

        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(Version::HTTP_2, &headers, true));
        assert!(!is_upgrade_request(Version::HTTP_11, &headers, false));
        assert!(!is_upgrade_request(Version::HTTP_11, &HeaderMap::new(), true));
    }

    #[test]
    fn restores_connection_and_upgrade() {
        let mut source = HeaderMap::new();
        source.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        source.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        let mut target = HeaderMap::new();
        target.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        restore_upgrade_headers(&source, &mut target);
        assert_eq!(target[header::CONNECTION], "Upgrade");
        assert_eq!(target[header::UPGRADE], "websocket");
    }
}
