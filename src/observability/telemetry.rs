//! Forwarder telemetry hooks.
//!
//! # Responsibilities
//! - Define the events the forwarder emits (start, stage, failure, stop, transfers)
//! - Provide a no-op sink and a `metrics`-backed sink
//!
//! # Design Decisions
//! - Every hook has an empty default, so sinks implement only what they record
//! - Transfer samples are plain values; sinks never see the copier's internals
//! - `is_enabled` lets the copier skip timing work entirely when nobody listens

use std::time::Duration;

use axum::http::StatusCode;

use crate::forwarder::ForwarderError;

/// Interval between "content transferring" events during one copy.
pub const TRANSFERRING_INTERVAL: Duration = Duration::from_secs(1);

/// Milestones within one forwarding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderStage {
    SendStart,
    SendStop,
    RequestContentTransferStart,
    ResponseContentTransferStart,
    ResponseUpgrade,
}

impl ForwarderStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwarderStage::SendStart => "send_start",
            ForwarderStage::SendStop => "send_stop",
            ForwarderStage::RequestContentTransferStart => "request_content_transfer_start",
            ForwarderStage::ResponseContentTransferStart => "response_content_transfer_start",
            ForwarderStage::ResponseUpgrade => "response_upgrade",
        }
    }
}

/// Snapshot of one body copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSample {
    /// Request direction (client to destination) when true.
    pub is_request: bool,
    pub bytes: u64,
    /// Number of reads that returned data.
    pub iops: u64,
    pub read_time: Duration,
    pub write_time: Duration,
    /// Time from the start of the copy to the first byte read.
    pub first_read_time: Option<Duration>,
}

/// Receiver for forwarder events.
pub trait ForwarderTelemetry: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    fn forwarder_start(&self, _destination_prefix: &str) {}

    fn forwarder_stage(&self, _stage: ForwarderStage) {}

    fn forwarder_failed(&self, _error: ForwarderError) {}

    fn forwarder_stop(&self, _status: StatusCode) {}

    /// Periodic progress, at most once per [`TRANSFERRING_INTERVAL`].
    fn content_transferring(&self, _sample: &TransferSample) {}

    /// Final totals, once per copy.
    fn content_transferred(&self, _sample: &TransferSample) {}
}

/// Sink that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl ForwarderTelemetry for NoopTelemetry {
    fn is_enabled(&self) -> bool {
        false
    }
}

/// Sink that feeds the process-wide `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsTelemetry;

impl ForwarderTelemetry for MetricsTelemetry {
    fn forwarder_start(&self, _destination_prefix: &str) {
        metrics::counter!("forwarder_requests_started_total").increment(1);
        metrics::gauge!("forwarder_requests_in_flight").increment(1.0);
    }

    fn forwarder_stage(&self, stage: ForwarderStage) {
        metrics::counter!("forwarder_stage_total", "stage" => stage.as_str()).increment(1);
    }

    fn forwarder_failed(&self, error: ForwarderError) {
        metrics::counter!("forwarder_requests_failed_total", "error" => error.as_str()).increment(1);
    }

    fn forwarder_stop(&self, status: StatusCode) {
        metrics::gauge!("forwarder_requests_in_flight").decrement(1.0);
        metrics::counter!("forwarder_requests_completed_total", "status" => status.as_u16().to_string())
            .increment(1);
    }

    fn content_transferred(&self, sample: &TransferSample) {
        let direction = if sample.is_request { "request" } else { "response" };
        metrics::counter!("forwarder_content_bytes_total", "direction" => direction).increment(sample.bytes);
        metrics::counter!("forwarder_content_iops_total", "direction" => direction).increment(sample.iops);
        metrics::histogram!("forwarder_content_read_seconds", "direction" => direction)
            .record(sample.read_time.as_secs_f64());
        metrics::histogram!("forwarder_content_write_seconds", "direction" => direction)
            .record(sample.write_time.as_secs_f64());
        if let Some(first_read) = sample.first_read_time {
            metrics::histogram!("forwarder_content_first_read_seconds", "direction" => direction)
                .record(first_read.as_secs_f64());
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording sink for tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Start(String),
        Stage(ForwarderStage),
        Failed(ForwarderError),
        Stop(StatusCode),
        Transferring(TransferSample),
        Transferred(TransferSample),
    }

    #[derive(Default)]
    pub struct RecordingTelemetry {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingTelemetry {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl ForwarderTelemetry for RecordingTelemetry {
        fn forwarder_start(&self, destination_prefix: &str) {
            self.push(Event::Start(destination_prefix.to_string()));
        }

        fn forwarder_stage(&self, stage: ForwarderStage) {
            self.push(Event::Stage(stage));
        }

        fn forwarder_failed(&self, error: ForwarderError) {
            self.push(Event::Failed(error));
        }

        fn forwarder_stop(&self, status: StatusCode) {
            self.push(Event::Stop(status));
        }

        fn content_transferring(&self, sample: &TransferSample) {
            self.push(Event::Transferring(*sample));
        }

        fn content_transferred(&self, sample: &TransferSample) {
            self.push(Event::Transferred(*sample));
        }
    }
}
