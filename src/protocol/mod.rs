//! Protocol helpers shared by the forwarder and the transforms.
//!
//! # Responsibilities
//! - Map inbound method strings onto outbound methods (rejecting CONNECT)
//! - Classify protocol versions and streaming (gRPC-like) requests
//! - Decide whether an inbound request carries a body
//! - Detect upgrade requests and restore upgrade headers
//! - Build destination URIs from a prefix, a path and a query
//!
//! # Design Decisions
//! - Pure functions over `http` types; no I/O happens here

pub mod content;
pub mod destination;
pub mod method;
pub mod upgrade;
pub mod version;

pub use content::{content_length, is_grpc_content_type, is_streaming_request, request_has_body};
pub use destination::{make_destination_address, DestinationError, MINIMUM_PREFIX_LEN};
pub use method::{get_http_method, MethodError};
pub use upgrade::{is_upgrade_request, restore_upgrade_headers};
pub use version::{is_http2_or_greater, parse_version, HttpVersionPolicy};
