/// A single inbound record: an opaque payload and the sequence number the
/// source assigned to it within its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    body: Vec<u8>,
    sequence_number: i64,
}

impl Record {
    pub fn new(body: impl Into<Vec<u8>>, sequence_number: i64) -> Self {
        Self {
            body: body.into(),
            sequence_number,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }
}

/// Read-only descriptor of the partition a batch was read from, used for
/// log and telemetry tagging only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionContext {
    partition_id: String,
    owner: String,
}

impl PartitionContext {
    pub fn new(partition_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            owner: owner.into(),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Ordered records of one partition, delivered to one forwarder invocation.
#[derive(Debug, Clone)]
pub struct Batch {
    context: PartitionContext,
    records: Vec<Record>,
}

impl Batch {
    pub fn new(context: PartitionContext) -> Self {
        Self {
            context,
            records: vec![],
        }
    }

    pub fn with_records(context: PartitionContext, records: Vec<Record>) -> Self {
        Self { context, records }
    }

    pub fn context(&self) -> &PartitionContext {
        &self.context
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence number of the last record, if any. The host uses it to
    /// advance the partition offset once the batch is done.
    pub fn last_sequence_number(&self) -> Option<i64> {
        self.records.last().map(Record::sequence_number)
    }
}
