use metrics::counter;
use tracing::{debug, error};

use crate::error::{RecordFailure, TelemetryError};
use crate::metrics_consts::{TELEMETRY_EVENTS, TELEMETRY_EXCEPTIONS};

pub const EVENT_PROCESSED: &str = "BatchForwarder/EventProcessed";

pub const PARTITION_ID_PROPERTY: &str = "partitionId";
pub const OWNER_PROPERTY: &str = "owner";
pub const SEQUENCE_NUMBER_PROPERTY: &str = "sequenceNumber";

/// Destination for named telemetry events and failed-record reports.
/// Both calls are fire-and-forget from the caller's side, but emitting an
/// event may still fail and is reported back so the caller can account for it.
pub trait TelemetrySink: Send + Sync {
    fn track_event(&self, name: &str, properties: &[(&str, String)])
        -> Result<(), TelemetryError>;

    fn track_exception(&self, failure: &RecordFailure);
}

/// Telemetry exported as prometheus counters plus structured log lines.
///
/// Only the partition id is used as a metric label; sequence numbers and
/// owners end up in the logs to keep label cardinality bounded.
#[derive(Clone, Default)]
pub struct MetricsTelemetry {}

impl MetricsTelemetry {
    pub fn new() -> Self {
        Self {}
    }
}

impl TelemetrySink for MetricsTelemetry {
    fn track_event(
        &self,
        name: &str,
        properties: &[(&str, String)],
    ) -> Result<(), TelemetryError> {
        if name.is_empty() {
            return Err(TelemetryError::InvalidEvent(
                "event name must not be empty".to_string(),
            ));
        }

        let partition = properties
            .iter()
            .find(|(key, _)| *key == PARTITION_ID_PROPERTY)
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        counter!(TELEMETRY_EVENTS, "event" => name.to_owned(), "partition" => partition)
            .increment(1);
        debug!(event = name, ?properties, "telemetry event");

        Ok(())
    }

    fn track_exception(&self, failure: &RecordFailure) {
        counter!(TELEMETRY_EXCEPTIONS, "kind" => failure.error().kind()).increment(1);
        let error: &(dyn std::error::Error + 'static) = failure.error();
        error!(
            index = failure.index(),
            sequence_number = failure.sequence_number(),
            kind = failure.error().kind(),
            error,
            "record processing failed"
        );
    }
}
