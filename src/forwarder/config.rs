//! Per-request forwarding options.

use std::time::Duration;

use axum::http::Version;

use crate::config::ForwarderConfig;
use crate::forwarder::activity::DEFAULT_ACTIVITY_TIMEOUT;
use crate::protocol::{parse_version, HttpVersionPolicy};

/// Options applied to a single forwarding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderRequestConfig {
    /// Cancel the attempt after this long without I/O progress.
    pub activity_timeout: Duration,
    /// Version requested on the outbound request (upgrades always use HTTP/1.1).
    pub version: Version,
    pub version_policy: HttpVersionPolicy,
}

impl Default for ForwarderRequestConfig {
    fn default() -> Self {
        Self {
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            version: Version::HTTP_11,
            version_policy: HttpVersionPolicy::RequestVersionOrLower,
        }
    }
}

impl From<&ForwarderConfig> for ForwarderRequestConfig {
    fn from(config: &ForwarderConfig) -> Self {
        Self {
            activity_timeout: Duration::from_secs(config.activity_timeout_secs),
            version: parse_version(&config.version).unwrap_or(Version::HTTP_11),
            version_policy: config.version_policy,
        }
    }
}
