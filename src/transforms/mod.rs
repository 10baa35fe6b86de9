//! Transform subsystem.
//!
//! # Data Flow
//! ```text
//! HttpContext (inbound head)
//!     → transform_request → ProxyRequest (outbound head)
//! destination response head
//!     → transform_response → ClientResponse (status already copied)
//! destination trailers
//!     → transform_response_trailers → ClientResponse trailers
//! ```
//!
//! # Design Decisions
//! - Hooks are async and boxed so transformers stay object safe
//! - Default hooks do the standard header copy (headers.rs)

pub mod headers;
pub mod transformer;

pub use headers::{copy_request_headers, copy_response_headers, copy_trailers, is_excluded};
pub use transformer::{DefaultTransformer, HeaderTransformer, HttpTransformer, ProxyRequest};
