//! HTTP version helpers.

use axum::http::Version;
use serde::{Deserialize, Serialize};

/// How strictly the outbound connection must honour the requested version.
///
/// The policy is attached to the outbound request as an extension; the send
/// primitive decides what to do with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpVersionPolicy {
    /// Use the requested version or downgrade.
    #[default]
    RequestVersionOrLower,
    /// Use exactly the requested version.
    RequestVersionExact,
    /// Use the requested version or upgrade.
    RequestVersionOrHigher,
}

/// True for HTTP/2 and HTTP/3.
pub fn is_http2_or_greater(version: Version) -> bool {
    version == Version::HTTP_2 || version == Version::HTTP_3
}

/// Parse a configured version ("1.0", "1.1", "2", "3").
pub fn parse_version(value: &str) -> Option<Version> {
    match value.trim() {
        "1.0" => Some(Version::HTTP_10),
        "1.1" => Some(Version::HTTP_11),
        "2" | "2.0" => Some(Version::HTTP_2),
        "3" | "3.0" => Some(Version::HTTP_3),
        _ => None,
    }
}
