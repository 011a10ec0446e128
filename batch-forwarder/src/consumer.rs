use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use tokio::sync::oneshot::Receiver;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::forwarder::BatchForwarder;
use crate::metrics_consts::{
    CONSUMER_BATCH_COLLECTION_DURATION_MS, CONSUMER_KAFKA_ERROR, CONSUMER_MESSAGES_RECEIVED,
};
use crate::record::{Batch, PartitionContext, Record};

// a zero timeout would turn the poll loop into a busy spin on empty batches
const MIN_BATCH_TIMEOUT: Duration = Duration::from_millis(10);

/// Drives a [`BatchForwarder`] from a Kafka topic: polls records, groups
/// them into per-partition batches and stores offsets once a batch has been
/// visited. Assignment and redelivery are left to librdkafka. Stored offsets
/// are committed by librdkafka, or by the loop itself when auto-commit is off.
pub struct BatchConsumer {
    consumer: StreamConsumer,
    topic: String,
    owner: String,
    auto_commit: bool,

    // how big should batches get and how long to wait
    // before we hand one to the forwarder
    batch_size: usize,
    batch_timeout: Duration,

    forwarder: BatchForwarder,

    // shutdown signal from the parent process, checked between batches
    shutdown_rx: Receiver<()>,
}

impl BatchConsumer {
    pub fn new(
        config: &Config,
        forwarder: BatchForwarder,
        shutdown_rx: Receiver<()>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = client_config(config)
            .create()
            .context("Failed to create Kafka consumer")?;
        consumer
            .subscribe(&[&config.kafka_source_topic])
            .with_context(|| {
                format!(
                    "Failed to subscribe to topic: {}",
                    config.kafka_source_topic
                )
            })?;

        info!(
            "Batch consumer initialized: consuming from '{}' as '{}'",
            config.kafka_source_topic, config.consumer_name
        );

        Ok(Self {
            consumer,
            topic: config.kafka_source_topic.clone(),
            owner: config.consumer_name.clone(),
            auto_commit: config.kafka_consumer_auto_commit,
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout_ms.0.max(MIN_BATCH_TIMEOUT),
            forwarder,
            shutdown_rx,
        })
    }

    /// Consume in a loop until the shutdown signal fires or a fatal Kafka
    /// error is returned.
    pub async fn start_consumption(self) -> Result<()> {
        info!("Starting batch consumption from {}", self.topic);

        let Self {
            consumer,
            topic,
            owner,
            auto_commit,
            batch_size,
            batch_timeout,
            forwarder,
            mut shutdown_rx,
        } = self;

        let mut stored_any = false;

        loop {
            let batches = tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received, stopping batch consumption");
                    break;
                }
                result = consume_batch(&consumer, &owner, batch_size, batch_timeout) => {
                    match result {
                        Ok(batches) => batches,
                        Err(e) => {
                            consumer.unsubscribe();
                            if e == KafkaError::Canceled {
                                info!("Consumer canceled - shutting down");
                                return Ok(());
                            }
                            return Err(anyhow::anyhow!(
                                "FATAL Kafka error - shutting down consume loop: {}",
                                e
                            ));
                        }
                    }
                }
            };

            let mut stored = false;
            for (partition, batch) in batches {
                if let Err(e) = forwarder.process_batch(&batch).await {
                    error!(
                        "Batch on partition {} finished with {} failed records: {}",
                        partition,
                        e.len(),
                        e
                    );
                }

                // the batch was visited in full, advance past it
                if let Some(last) = batch.last_sequence_number() {
                    match consumer.store_offset(&topic, partition, last + 1) {
                        Ok(()) => stored = true,
                        Err(e) => {
                            warn!("Failed to store offset for partition {partition}: {e}")
                        }
                    }
                }
            }

            if stored && !auto_commit {
                if let Err(e) = consumer.commit_consumer_state(CommitMode::Async) {
                    warn!("Failed to commit stored offsets: {e}");
                }
            }
            stored_any |= stored;
        }

        if stored_any && !auto_commit {
            if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
                warn!("Failed to commit stored offsets on shutdown: {e}");
            }
        }

        consumer.unsubscribe();
        info!("Batch consumer shut down");

        Ok(())
    }
}

fn client_config(config: &Config) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &config.kafka_consumer_group)
        .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
        // offsets are stored once a batch has been fully visited
        .set("enable.auto.offset.store", "false")
        .set(
            "enable.auto.commit",
            config.kafka_consumer_auto_commit.to_string(),
        );

    if config.kafka_consumer_auto_commit {
        client_config.set(
            "auto.commit.interval.ms",
            config.kafka_consumer_auto_commit_interval_ms.to_string(),
        );
    }

    if config.kafka.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    client_config
}

/// Collect up to `batch_size` messages, or whatever arrived before
/// `batch_timeout`, grouped into one batch per partition.
async fn consume_batch(
    consumer: &StreamConsumer,
    owner: &str,
    batch_size: usize,
    batch_timeout: Duration,
) -> KafkaResult<BTreeMap<i32, Batch>> {
    let start = Instant::now();
    let deadline = start + batch_timeout;
    let mut messages = Vec::with_capacity(batch_size);
    let mut kafka_error_count = 0;

    while messages.len() < batch_size {
        let message = match timeout_at(deadline, consumer.recv()).await {
            Err(_) => break,
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                kafka_error_count += 1;
                if let Some(e) = handle_kafka_error(e, kafka_error_count).await {
                    return Err(e);
                }
                continue;
            }
        };
        kafka_error_count = 0;

        let record = Record::new(message.payload().unwrap_or_default(), message.offset());
        messages.push((message.partition(), record));
    }

    metrics::histogram!(CONSUMER_BATCH_COLLECTION_DURATION_MS)
        .record(start.elapsed().as_millis() as f64);
    metrics::counter!(CONSUMER_MESSAGES_RECEIVED).increment(messages.len() as u64);

    Ok(group_by_partition(messages, owner))
}

/// Split consumed records into per-partition batches, keeping arrival order
/// inside each partition.
pub fn group_by_partition(
    messages: impl IntoIterator<Item = (i32, Record)>,
    owner: &str,
) -> BTreeMap<i32, Batch> {
    let mut batches: BTreeMap<i32, Batch> = BTreeMap::new();
    for (partition, record) in messages {
        batches
            .entry(partition)
            .or_insert_with(|| Batch::new(PartitionContext::new(partition.to_string(), owner)))
            .push(record);
    }
    batches
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// back off and poll again
    Transient,
    /// end the consume loop
    Fatal,
}

fn classify_kafka_error(e: &KafkaError) -> ErrorClass {
    match e {
        KafkaError::MessageConsumptionFatal(_)
        | KafkaError::Global(RDKafkaErrorCode::Authentication)
        | KafkaError::Canceled => ErrorClass::Fatal,
        _ => ErrorClass::Transient,
    }
}

fn transient_backoff(current_count: u64) -> Duration {
    Duration::from_millis(100 * current_count.clamp(1, 10))
}

/// Returns the error back when the loop must stop; otherwise sleeps off a
/// transient error and returns `None`.
async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<KafkaError> {
    match classify_kafka_error(&e) {
        ErrorClass::Fatal => {
            if e == KafkaError::Canceled {
                info!("Kafka consumer canceled");
            } else {
                error!("Fatal Kafka consumer error: {e}");
            }
            metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "fatal").increment(1);
            Some(e)
        }
        ErrorClass::Transient => {
            warn!("Kafka consumer error ({current_count} in a row): {e}");
            metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "transient").increment(1);
            sleep(transient_backoff(current_count)).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use envconfig::Envconfig;
    use rdkafka::consumer::BaseConsumer;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::{Offset, TopicPartitionList};
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use uuid::Uuid;

    use super::*;
    use crate::config::KafkaConfig;
    use crate::error::SinkError;
    use crate::sink::{KafkaSink, OutboundSink};
    use crate::telemetry::MetricsTelemetry;

    #[derive(Default)]
    struct CollectingSink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl CollectingSink {
        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundSink for CollectingSink {
        async fn send(&self, payload: Vec<u8>) -> Result<(), SinkError> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    async fn wait_for_records(sink: &CollectingSink, count: usize) -> Vec<Vec<u8>> {
        timeout(Duration::from_secs(20), async {
            loop {
                let sent = sink.sent();
                if sent.len() >= count {
                    return sent;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("Timeout waiting for forwarded records")
    }

    fn consumer_config(kafka: &KafkaConfig, topic: &str, group: &str) -> Config {
        let mut config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        config.kafka = kafka.clone();
        config.kafka_source_topic = topic.to_string();
        config.kafka_consumer_group = group.to_string();
        config.kafka_consumer_offset_reset = "earliest".to_string();
        config.kafka_consumer_auto_commit = false;
        config.batch_timeout_ms.0 = Duration::from_millis(200);
        config
    }

    fn collecting_forwarder(sink: &Arc<CollectingSink>) -> BatchForwarder {
        BatchForwarder::new(sink.clone(), Arc::new(MetricsTelemetry::new()))
    }

    #[test]
    fn auto_commit_flag_is_always_passed_to_librdkafka() {
        let mut config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        let client = client_config(&config);
        assert_eq!(client.get("enable.auto.commit"), Some("true"));
        assert_eq!(client.get("auto.commit.interval.ms"), Some("5000"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));

        config.kafka_consumer_auto_commit = false;
        let client = client_config(&config);
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("auto.commit.interval.ms"), None);
    }

    #[tokio::test]
    async fn kafka_errors_split_into_transient_and_fatal() {
        let transient = [
            KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut),
            KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
        ];
        for e in transient {
            assert_eq!(handle_kafka_error(e, 1).await, None);
        }

        let fatal = [
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::InvalidGroupId),
            KafkaError::Global(RDKafkaErrorCode::Authentication),
            KafkaError::Canceled,
        ];
        for e in fatal {
            assert_eq!(handle_kafka_error(e.clone(), 1).await, Some(e));
        }
    }

    #[test]
    fn transient_backoff_is_capped() {
        assert_eq!(transient_backoff(0), Duration::from_millis(100));
        assert_eq!(transient_backoff(3), Duration::from_millis(300));
        assert_eq!(transient_backoff(500), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_batch_settings_are_clamped() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let topic = format!("test_clamp_{}", Uuid::now_v7());
        let mut config = consumer_config(&kafka_config(&cluster), &topic, "test_clamp");
        config.batch_size = 0;
        config.batch_timeout_ms.0 = Duration::ZERO;

        let sink = Arc::new(CollectingSink::default());
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer = BatchConsumer::new(&config, collecting_forwarder(&sink), shutdown_rx)
            .expect("failed to create consumer");

        assert_eq!(consumer.batch_size, 1);
        assert_eq!(consumer.batch_timeout, MIN_BATCH_TIMEOUT);
    }

    #[tokio::test]
    async fn shutdown_before_any_message_forwards_nothing() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let topic = format!("test_idle_{}", Uuid::now_v7());
        assert_eq!(cluster.create_topic(&topic, 1, 1), Ok(()));
        let config = consumer_config(&kafka_config(&cluster), &topic, "test_idle");

        let sink = Arc::new(CollectingSink::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer = BatchConsumer::new(&config, collecting_forwarder(&sink), shutdown_rx)
            .expect("failed to create consumer");
        let handle = tokio::spawn(consumer.start_consumption());

        shutdown_tx.send(()).unwrap();
        let result = timeout(Duration::from_secs(10), handle)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked");

        assert!(result.is_ok());
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_records_are_committed_and_not_redelivered() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let topic = format!("test_offsets_{}", Uuid::now_v7());
        let group = format!("test_group_{}", Uuid::now_v7());
        assert_eq!(cluster.create_topic(&topic, 1, 1), Ok(()));

        let kafka = kafka_config(&cluster);
        let source = KafkaSink::new(&kafka, topic.clone()).expect("source producer");
        for payload in [vec![0xff], b"ok".to_vec()] {
            source.send(payload).await.expect("failed to seed source");
        }
        let config = consumer_config(&kafka, &topic, &group);

        let first = Arc::new(CollectingSink::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer = BatchConsumer::new(&config, collecting_forwarder(&first), shutdown_rx)
            .expect("failed to create consumer");
        let handle = tokio::spawn(consumer.start_consumption());

        assert_eq!(wait_for_records(&first, 1).await, vec![b"ok".to_vec()]);
        shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(10), handle)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked")
            .expect("consumer returned an error");

        // the invalid record at offset 0 is skipped along with the rest
        let checker: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.kafka_hosts)
            .set("group.id", &group)
            .create()
            .expect("Failed to create consumer");
        let mut partitions = TopicPartitionList::new();
        partitions.add_partition(&topic, 0);
        let committed = checker
            .committed_offsets(partitions, Duration::from_secs(10))
            .expect("Failed to fetch committed offsets");
        let offset = committed
            .find_partition(&topic, 0)
            .expect("partition missing from committed offsets")
            .offset();
        assert_eq!(offset, Offset::Offset(2));

        // a second member of the group resumes after both seeded records
        let second = Arc::new(CollectingSink::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer = BatchConsumer::new(&config, collecting_forwarder(&second), shutdown_rx)
            .expect("failed to create consumer");
        let handle = tokio::spawn(consumer.start_consumption());

        source
            .send(b"next".to_vec())
            .await
            .expect("failed to seed source");
        assert_eq!(wait_for_records(&second, 1).await, vec![b"next".to_vec()]);

        shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(10), handle)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked")
            .expect("consumer returned an error");
        assert_eq!(second.sent(), vec![b"next".to_vec()]);
    }

    #[test]
    fn groups_records_by_partition_in_arrival_order() {
        let messages = vec![
            (1, Record::new("a", 10)),
            (0, Record::new("b", 3)),
            (1, Record::new("c", 11)),
            (0, Record::new("d", 4)),
            (2, Record::new("e", 0)),
        ];

        let batches = group_by_partition(messages, "host-a");

        assert_eq!(batches.len(), 3);
        let one = &batches[&1];
        assert_eq!(one.context().partition_id(), "1");
        assert_eq!(one.context().owner(), "host-a");
        let bodies: Vec<&[u8]> = one.records().iter().map(Record::body).collect();
        assert_eq!(bodies, vec![b"a".as_slice(), b"c".as_slice()]);
        assert_eq!(one.last_sequence_number(), Some(11));
        assert_eq!(batches[&0].last_sequence_number(), Some(4));
        assert_eq!(batches[&2].len(), 1);
    }

    #[test]
    fn no_messages_no_batches() {
        assert!(group_by_partition(vec![], "host-a").is_empty());
    }

    fn kafka_config(cluster: &MockCluster<'static, DefaultProducerContext>) -> KafkaConfig {
        KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 5000,
            kafka_compression_codec: "none".to_string(),
        }
    }

    #[tokio::test]
    async fn forwards_from_source_to_destination_topic() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let source_topic = format!("test_source_{}", Uuid::now_v7());
        let dest_topic = format!("test_dest_{}", Uuid::now_v7());
        assert_eq!(cluster.create_topic(&source_topic, 1, 1), Ok(()));
        assert_eq!(cluster.create_topic(&dest_topic, 1, 1), Ok(()));

        let kafka = kafka_config(&cluster);
        let source = KafkaSink::new(&kafka, source_topic.clone()).expect("source producer");
        for payload in [b"42".to_vec(), vec![0xc3, 0x28], b"7".to_vec()] {
            source.send(payload).await.expect("failed to seed source");
        }

        let mut config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        config.kafka = kafka.clone();
        config.kafka_source_topic = source_topic;
        config.kafka_destination_topic = dest_topic.clone();
        config.kafka_consumer_offset_reset = "earliest".to_string();
        config.batch_timeout_ms.0 = Duration::from_millis(200);

        let destination =
            KafkaSink::new(&kafka, dest_topic.clone()).expect("destination producer");
        let forwarder =
            BatchForwarder::new(Arc::new(destination), Arc::new(MetricsTelemetry::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer = BatchConsumer::new(&config, forwarder, shutdown_rx).unwrap();
        let handle = tokio::spawn(consumer.start_consumption());

        let reader: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.kafka_hosts)
            .set("group.id", "test_reader")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .create()
            .expect("Failed to create consumer");
        reader
            .subscribe(&[&dest_topic])
            .expect("Failed to subscribe to destination topic");

        let mut received = vec![];
        for _ in 0..2 {
            let message = timeout(Duration::from_secs(20), reader.recv())
                .await
                .expect("Timeout waiting for forwarded message")
                .expect("Failed to receive forwarded message");
            received.push(message.payload().unwrap_or_default().to_vec());
        }
        assert_eq!(received, vec![b"42".to_vec(), b"7".to_vec()]);

        shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(10), handle)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked")
            .expect("consumer returned an error");
    }
}
