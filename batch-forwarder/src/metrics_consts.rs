// ==== Forwarder metrics ====
/// Histogram of records per batch handed to the forwarder
pub const FORWARDER_BATCH_SIZE: &str = "batch_forwarder_batch_size";

/// Counter of visited records, tagged by "status" (forwarded, failed)
pub const FORWARDER_RECORDS: &str = "batch_forwarder_records_total";

/// Counter of batch outcomes, tagged by "outcome" (success, partial_failure, failure)
pub const FORWARDER_BATCHES: &str = "batch_forwarder_batches_total";

// ==== Telemetry metrics ====
pub const TELEMETRY_EVENTS: &str = "batch_forwarder_telemetry_events_total";
pub const TELEMETRY_EXCEPTIONS: &str = "batch_forwarder_telemetry_exceptions_total";

// ==== Sink metrics ====
pub const SINK_RECORDS_PRODUCED: &str = "batch_forwarder_records_produced_total";
pub const SINK_RECORDS_DROPPED: &str = "batch_forwarder_records_dropped_total";
pub const SINK_PRODUCE_ERRORS: &str = "batch_forwarder_produce_errors_total";

// ==== Consumer metrics ====
pub const CONSUMER_MESSAGES_RECEIVED: &str = "batch_forwarder_messages_received_total";
pub const CONSUMER_KAFKA_ERROR: &str = "batch_forwarder_kafka_consumer_error";
pub const CONSUMER_BATCH_COLLECTION_DURATION_MS: &str =
    "batch_forwarder_batch_collection_duration_ms";
