pub mod config;
pub mod consumer;
pub mod error;
pub mod forwarder;
pub mod metrics_consts;
pub mod record;
pub mod sink;
pub mod telemetry;
