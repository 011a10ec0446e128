use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::error::SinkError;
use crate::metrics_consts::{SINK_PRODUCE_ERRORS, SINK_RECORDS_DROPPED, SINK_RECORDS_PRODUCED};

/// Destination for forwarded records. A call returns once the record is
/// accepted, so callers awaiting it get ordered submissions.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, payload: Vec<u8>) -> Result<(), SinkError>;
}

pub struct PrintSink {}

#[async_trait]
impl OutboundSink for PrintSink {
    async fn send(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        info!("outbound record: {}", String::from_utf8_lossy(&payload));
        counter!(SINK_RECORDS_PRODUCED, "sink" => "print").increment(1);

        Ok(())
    }
}

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("batch_forwarder_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("batch_forwarder_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("batch_forwarder_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("batch_forwarder_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("batch_forwarder_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "batch_forwarder_kafka_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                "batch_forwarder_kafka_broker_tx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.txerrs);
        }
    }
}

#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig, topic: String) -> anyhow::Result<KafkaSink> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext)?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers, producing to {}", topic);

        Ok(KafkaSink { producer, topic })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }

    fn enqueue(&self, payload: &[u8]) -> Result<DeliveryFuture, SinkError> {
        let record = FutureRecord::<(), [u8]>::to(&self.topic).payload(payload);

        match self.producer.send_result(record) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    counter!(SINK_RECORDS_DROPPED, "cause" => "kafka_message_size").increment(1);
                    Err(SinkError::RecordTooBig)
                }
                _ => {
                    counter!(SINK_RECORDS_DROPPED, "cause" => "kafka_write_error").increment(1);
                    error!("failed to enqueue record: {}", e);
                    Err(SinkError::Produce(e))
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), SinkError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!(SINK_PRODUCE_ERRORS).increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(SinkError::Canceled)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                // Rejected by broker due to message size
                counter!(SINK_RECORDS_DROPPED, "cause" => "kafka_message_size").increment(1);
                Err(SinkError::RecordTooBig)
            }
            Ok(Err((err, _))) => {
                counter!(SINK_PRODUCE_ERRORS).increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(SinkError::Produce(err))
            }
            Ok(Ok(_)) => {
                counter!(SINK_RECORDS_PRODUCED, "sink" => "kafka").increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl OutboundSink for KafkaSink {
    async fn send(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        let ack = self.enqueue(&payload)?;
        Self::process_ack(ack).await
    }
}
