//! Switchyard Worker - RabbitMQ consumer hosting the tokenizer.
//!
//! This worker consumes requests from one priority queue, tokenizes the text
//! and publishes each response to the caller's reply queue.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use switchyard::util::shutdown_signal;
use switchyard::worker::WhitespaceTokenizer;
use switchyard::{Config, QueueWorker, WorkerHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    let settings = config
        .consumer_settings()
        .context("Invalid queue configuration")?;
    tracing::info!(
        amqp_url_set = !config.amqp_url.is_empty(),
        exchange = %settings.exchange,
        queue = %settings.queue,
        max_priority = settings.max_priority,
        batch_size = config.batch_size,
        "config_loaded"
    );

    let tokenizer = WhitespaceTokenizer::with_batch_size(config.batch_size)
        .context("Invalid BATCH_SIZE")?;
    let worker = QueueWorker::new(WorkerHandle::batched(tokenizer));

    worker.run(&settings, shutdown_signal()).await?;

    tracing::info!("worker_shutdown_complete");

    Ok(())
}
