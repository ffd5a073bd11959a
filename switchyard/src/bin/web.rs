//! Switchyard Web Server - synchronous RPC over HTTP.
//!
//! This binary serves one POST endpoint. Each request is routed by its
//! `token` header to a worker, either in-process or behind a RabbitMQ
//! queue, and the worker's response is returned to the caller.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use switchyard::util::shutdown_signal;
use switchyard::web::router;
use switchyard::worker::WhitespaceTokenizer;
use switchyard::{
    AppState, Config, Dispatch, DispatchMode, Dispatcher, ServiceConfig, WorkerHandle,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        route = %config.route,
        mode = ?config.dispatch_mode,
        tokens = config.token_queues.len(),
        application_required = config.application_required,
        "config_loaded"
    );

    let service = service_config(&config)?;
    let dispatcher = Dispatcher::new(service);

    dispatcher
        .prepare()
        .await
        .context("Failed to declare RabbitMQ topology")?;

    let route = config.rpc_route().context("Invalid ROUTE")?;
    let state = AppState::new(dispatcher);
    let app = router(state.clone(), route);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error")?;

    // Close broker connection
    state.dispatcher.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Build the service from the environment.
///
/// Local mode serves every configured token with an in-process tokenizer.
fn service_config(config: &Config) -> Result<ServiceConfig> {
    let service = match config.dispatch_mode {
        DispatchMode::Local => {
            let tokenizer = WhitespaceTokenizer::with_batch_size(config.batch_size)
                .context("Invalid BATCH_SIZE")?;
            let handle = WorkerHandle::batched(tokenizer);
            let workers: HashMap<String, WorkerHandle> = config
                .token_queues
                .keys()
                .map(|token| (token.clone(), handle.clone()))
                .collect();
            ServiceConfig::local(workers)
        }
        DispatchMode::Remote => {
            let broker = config
                .broker_settings()
                .context("Invalid priority configuration")?;
            ServiceConfig::remote(config.token_queues.clone(), broker)
        }
    }
    .context("Invalid token configuration")?;

    Ok(service.with_application_required(config.application_required))
}
