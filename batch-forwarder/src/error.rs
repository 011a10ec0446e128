use std::str::Utf8Error;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors returned by an outbound sink for a single submission.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("record is too big for the destination")]
    RecordTooBig,
    #[error("failed to produce record")]
    Produce(#[from] KafkaError),
    #[error("record delivery was canceled before an ack")]
    Canceled,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("telemetry event is invalid: {0}")]
    InvalidEvent(String),
}

/// Why a single record could not be forwarded. The detail lives in the
/// source, not in the message.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("payload is not valid UTF-8")]
    Decode(#[from] Utf8Error),
    #[error("failed to submit record")]
    Submit(#[from] SinkError),
    #[error("failed to track telemetry")]
    Telemetry(#[from] TelemetryError),
}

impl RecordError {
    /// Stable label used to tag metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordError::Decode(_) => "decode",
            RecordError::Submit(_) => "submit",
            RecordError::Telemetry(_) => "telemetry",
        }
    }
}

/// A record error together with the position of the record it came from.
#[derive(Error, Debug)]
#[error("record {index} (sequence number {sequence_number}) failed")]
pub struct RecordFailure {
    index: usize,
    sequence_number: i64,
    #[source]
    error: RecordError,
}

impl RecordFailure {
    pub fn new(index: usize, sequence_number: i64, error: RecordError) -> Self {
        Self {
            index,
            sequence_number,
            error,
        }
    }

    /// Position of the record within its batch.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn error(&self) -> &RecordError {
        &self.error
    }

    pub fn into_error(self) -> RecordError {
        self.error
    }
}

/// Batch-level failure, surfaced only after every record has been visited.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Record(RecordFailure),
    #[error("{} records failed in batch", .0.len())]
    Aggregate(Vec<RecordFailure>),
}

impl BatchError {
    /// Reduce the failures collected over a batch into its outcome.
    pub fn from_failures(mut failures: Vec<RecordFailure>) -> Result<(), BatchError> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(BatchError::Record(failures.remove(0))),
            _ => Err(BatchError::Aggregate(failures)),
        }
    }

    pub fn failures(&self) -> &[RecordFailure] {
        match self {
            BatchError::Record(failure) => std::slice::from_ref(failure),
            BatchError::Aggregate(failures) => failures,
        }
    }

    pub fn len(&self) -> usize {
        self.failures().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures().is_empty()
    }
}
