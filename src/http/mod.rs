//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, route lookup)
//!     → context.rs (request parts + body, lazily started client response)
//!     → [forwarder drives the exchange]
//!     → body.rs (channel-backed response body, AsyncRead over request bodies)
//!     → Send to client
//! ```

pub mod body;
pub mod context;
pub mod server;

pub use body::{body_channel, BodyReader, ChannelBody, ChannelWriter};
pub use context::{ClientResponse, HttpContext, ResponseReceiver, ResponseTermination};
pub use server::{build_router, AppState, HttpServer};
