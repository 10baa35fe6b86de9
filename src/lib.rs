//! HTTP request forwarder library.
//!
//! Forwards one inbound request to a destination prefix and streams the
//! response back, with per-request idle timeouts, upgrade tunnelling and a
//! single classified outcome per exchange.

pub mod config;
pub mod forwarder;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod transforms;

pub use config::schema::ProxyConfig;
pub use forwarder::{ForwarderError, HttpForwarder};
pub use http::{HttpContext, HttpServer};
pub use lifecycle::Shutdown;
