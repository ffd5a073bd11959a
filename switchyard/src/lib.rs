//! Switchyard - synchronous HTTP dispatch over pluggable workers.
//!
//! This library provides shared modules for the two Switchyard binaries:
//! - `switchyard-web`: HTTP server that answers each request with a worker's response
//! - `switchyard-worker`: RabbitMQ consumer hosting a worker behind a priority queue
//!
//! ## Architecture
//!
//! ```text
//! HTTP → Web Server → Dispatcher ─┬─ local ──────────────────────────► Worker
//!                                 └─ remote → exchange → queue → QueueWorker → Worker
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod response;
pub mod util;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, DispatchMode};
pub use dispatch::{Dispatch, DispatchRequest, Dispatcher, MultiDispatcher, ServiceConfig};
pub use error::{ConfigError, DispatchError, QueueError, WorkerError};
pub use queue::{QueueClient, QueueWorker};
pub use response::{Content, Response};
pub use web::AppState;
pub use worker::{BatchWorker, Request, Worker, WorkerHandle};
