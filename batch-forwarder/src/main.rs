use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use batch_forwarder::config::Config;
use batch_forwarder::consumer::BatchConsumer;
use batch_forwarder::forwarder::BatchForwarder;
use batch_forwarder::sink::{KafkaSink, OutboundSink, PrintSink};
use batch_forwarder::telemetry::MetricsTelemetry;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutdown status change: TERMINATING");
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(|| async { "batch-forwarder" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route("/_liveness", get(|| async { "ok" }));

    let router = if config.export_prometheus {
        let recorder_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install metrics recorder")?;
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    };

    let bind = config.bind_address.clone();

    Ok(tokio::task::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind {}: {}", bind, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!("failed to serve metrics: {}", e);
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();

    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting batch-forwarder service");
    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address);

    let kafka_sink = if config.print_sink {
        None
    } else {
        Some(
            KafkaSink::new(&config.kafka, config.kafka_destination_topic.clone())
                .context("Failed to create Kafka sink")?,
        )
    };
    let sink: Arc<dyn OutboundSink> = match &kafka_sink {
        Some(kafka_sink) => Arc::new(kafka_sink.clone()),
        None => Arc::new(PrintSink {}),
    };

    let forwarder = BatchForwarder::new(sink, Arc::new(MetricsTelemetry::new()));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let consumer = BatchConsumer::new(&config, forwarder, shutdown_rx)
        .context("Failed to create batch consumer")?;

    tokio::spawn(async move {
        shutdown().await;
        _ = shutdown_tx.send(());
    });

    // Blocks until shutdown or a fatal consumer error
    let result = consumer.start_consumption().await;

    if let Some(kafka_sink) = kafka_sink {
        info!(
            "Graceful shutdown: flushing producer to dest topic {}...",
            kafka_sink.topic()
        );
        let timeout = Duration::from_secs(config.kafka_producer_graceful_shutdown_secs);
        if let Err(e) = kafka_sink.flush(timeout) {
            warn!("Failed to flush producer on graceful shutdown: {e:?}");
        }
    }

    server_handle.abort();
    info!("Graceful shutdown: completed");

    result
}
