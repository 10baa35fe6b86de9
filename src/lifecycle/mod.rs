//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → stop accepting → drain in-flight requests (bounded) → exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: forced exit after the grace period

pub mod shutdown;
pub mod signals;

pub use shutdown::{drain_with_grace, Shutdown};
pub use signals::shutdown_on_signal;
