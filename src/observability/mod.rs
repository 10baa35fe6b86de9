//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! forwarder / copier events
//!     → telemetry.rs (ForwarderTelemetry sink: no-op, metrics, test recorder)
//! host request completion
//!     → metrics.rs (counters, histograms, Prometheus endpoint)
//! all subsystems
//!     → logging.rs (structured log events)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON optional) for machine parsing
//! - Request IDs are assigned on the way in and echoed on the way out
//! - Metrics are cheap (no-ops without a recorder)

pub mod logging;
pub mod metrics;
pub mod telemetry;

pub use telemetry::{ForwarderStage, ForwarderTelemetry, MetricsTelemetry, NoopTelemetry, TransferSample};
