use std::sync::Arc;

use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::error::{BatchError, RecordError, RecordFailure};
use crate::metrics_consts::{FORWARDER_BATCHES, FORWARDER_BATCH_SIZE, FORWARDER_RECORDS};
use crate::record::{Batch, PartitionContext, Record};
use crate::sink::OutboundSink;
use crate::telemetry::{
    TelemetrySink, EVENT_PROCESSED, OWNER_PROPERTY, PARTITION_ID_PROPERTY,
    SEQUENCE_NUMBER_PROPERTY,
};

pub type BatchOutcome = Result<(), BatchError>;

/// Forwards every record of a partition batch to the outbound sink.
///
/// Records are handled strictly in order and each submission is awaited
/// before the next record starts. A failing record never stops the batch:
/// its error is collected and the remaining records are still forwarded.
/// The collected failures are reported once, after the last record.
#[derive(Clone)]
pub struct BatchForwarder {
    sink: Arc<dyn OutboundSink>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl BatchForwarder {
    pub fn new(sink: Arc<dyn OutboundSink>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { sink, telemetry }
    }

    pub async fn process_batch(&self, batch: &Batch) -> BatchOutcome {
        let context = batch.context();
        info!(
            "Batch count = {}, Partition = {}, Owner = {}",
            batch.len(),
            context.partition_id(),
            context.owner()
        );
        histogram!(FORWARDER_BATCH_SIZE).record(batch.len() as f64);

        let mut failures = Vec::new();
        for (index, record) in batch.records().iter().enumerate() {
            match self.process_record(context, record).await {
                Ok(()) => {
                    counter!(FORWARDER_RECORDS, "status" => "forwarded").increment(1);
                }
                Err(error) => {
                    counter!(FORWARDER_RECORDS, "status" => "failed").increment(1);
                    let failure = RecordFailure::new(index, record.sequence_number(), error);
                    self.telemetry.track_exception(&failure);
                    failures.push(failure);
                }
            }
        }

        let outcome = match failures.len() {
            0 => "success",
            n if n == batch.len() => "failure",
            _ => "partial_failure",
        };
        counter!(FORWARDER_BATCHES, "outcome" => outcome).increment(1);
        if !failures.is_empty() {
            warn!(
                "{} of {} records failed on partition {}",
                failures.len(),
                batch.len(),
                context.partition_id()
            );
        }

        BatchError::from_failures(failures)
    }

    async fn process_record(
        &self,
        context: &PartitionContext,
        record: &Record,
    ) -> Result<(), RecordError> {
        let message = std::str::from_utf8(record.body())?;

        info!("message = {}", message);

        self.telemetry.track_event(
            EVENT_PROCESSED,
            &[
                (PARTITION_ID_PROPERTY, context.partition_id().to_owned()),
                (OWNER_PROPERTY, context.owner().to_owned()),
                (
                    SEQUENCE_NUMBER_PROPERTY,
                    record.sequence_number().to_string(),
                ),
            ],
        )?;

        self.sink.send(message.as_bytes().to_vec()).await?;

        Ok(())
    }
}
