//! RabbitMQ plumbing for remote workers.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher → QueueClient → exchange ─(routing key = queue name)─► QueueWorker → Worker
//!                  ▲                                                    │
//!                  └──────────── reply_to + correlation_id ─────────────┘
//! ```

pub mod client;
pub mod consumer;
pub mod topology;
pub mod types;

pub use client::{CorrelationTable, PendingReplies, QueueClient};
pub use consumer::{AmqpWorkQueue, ConsumeMode, ConsumerSettings, QueueWorker, WorkQueue};
pub use types::{Fetched, QueueItem, Rejected, ReplyAddress};
