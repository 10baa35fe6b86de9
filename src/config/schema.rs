//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the forwarder host.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::protocol::HttpVersionPolicy;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Forwarding behaviour applied to every request.
    pub forwarder: ForwarderConfig,

    /// Outbound connection pool settings.
    pub client: ClientConfig,

    /// Route definitions mapping requests to destinations.
    pub routes: Vec<RouteConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum request body size in bytes. Lifted for streaming (gRPC) requests.
    pub max_request_body_bytes: usize,

    /// Time allowed for in-flight requests to finish after shutdown starts.
    pub shutdown_grace_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_request_body_bytes: 30 * 1024 * 1024,
            shutdown_grace_secs: 30,
        }
    }
}

/// Forwarding behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Cancel a request after this many seconds without I/O progress.
    pub activity_timeout_secs: u64,

    /// Outbound HTTP version ("1.0", "1.1", "2").
    pub version: String,

    /// How strictly the outbound version is honoured.
    pub version_policy: HttpVersionPolicy,

    /// Drop distributed-tracing headers (traceparent, baggage, ...) in both directions.
    pub skip_tracing_headers: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: 100,
            version: "1.1".to_string(),
            version_policy: HttpVersionPolicy::RequestVersionOrLower,
            skip_tracing_headers: true,
        }
    }
}

/// Outbound connection pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Idle pooled connections are closed after this many seconds.
    pub pool_idle_timeout_secs: u64,

    /// Maximum idle connections kept per destination host.
    pub pool_max_idle_per_host: usize,

    /// Speak HTTP/2 with prior knowledge to every destination.
    pub http2_only: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 64,
            http2_only: false,
        }
    }
}

/// Route configuration mapping requests to a destination.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Absolute destination prefix, e.g. "http://127.0.0.1:3000/base".
    pub destination: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
