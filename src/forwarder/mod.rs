//! Forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! HttpContext (inbound request, client response)
//!     → engine.rs (one forwarding attempt, error classification)
//!         → activity.rs (idle timeout linked to client abort)
//!         → content.rs (request body copied on demand, in its own task)
//!         → client.rs (send primitive)
//!         → copier.rs (response body, duplex halves)
//!         → upgrade.rs (101 handling, duplex pump)
//!     → ForwarderError + ForwarderErrorFeature on the context
//! ```
//!
//! # Design Decisions
//! - One `HttpForwarder` is shared by every request; per-request state lives in
//!   the context and the rented activity timer
//! - Copy failures are classified by side (input, output, canceled) and then mapped
//!   to a forwarding error by direction
//! - No retries: a request body can only be consumed once

pub mod activity;
pub mod client;
pub mod config;
pub mod content;
pub mod copier;
pub mod engine;
pub mod error;
pub mod upgrade;

pub use activity::{ActivityCancellation, ActivityTimeoutPool, ActivityToken, DEFAULT_ACTIVITY_TIMEOUT};
pub use client::{build_http_client, negotiate_version, ForwarderHttpClient, PooledHttpClient, UnsupportedVersion};
pub use config::ForwarderRequestConfig;
pub use content::{request_body_copy, BodyConsumedError, RequestBodyCopyTask, StreamCopyHttpContent};
pub use copier::{BufferPool, StreamCopier, StreamCopyOutcome, StreamCopyResult, DEFAULT_BUFFER_SIZE};
pub use engine::HttpForwarder;
pub use error::{AggregateError, BoxError, ForwarderError, ForwarderErrorFeature, SharedError};
pub use upgrade::copy_duplex;
