//! Exchange and queue declarations shared by both sides of the RPC.
//!
//! Requests are routed through one direct exchange whose routing keys are
//! queue names. Every worker queue is declared with the same
//! `x-max-priority` argument; the broker rejects a redeclaration with
//! different arguments, so both sides must go through these helpers.

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};
use tracing::info;

use super::types::MAX_PRIORITY_ARGUMENT;
use crate::error::QueueError;

/// Arguments for a priority-capable worker queue.
pub fn priority_queue_arguments(max_priority: u8) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        MAX_PRIORITY_ARGUMENT.into(),
        AMQPValue::LongInt(i32::from(max_priority)),
    );
    arguments
}

/// Declare the direct exchange (idempotent).
pub async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), QueueError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(QueueError::Topology)?;

    info!(exchange = exchange, "rabbitmq_exchange_declared");
    Ok(())
}

/// Declare a worker queue with priorities `1..=max_priority` and bind it to
/// the exchange under its own name.
pub async fn declare_worker_queue(
    channel: &Channel,
    exchange: &str,
    queue: &str,
    max_priority: u8,
) -> Result<(), QueueError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions::default(),
            priority_queue_arguments(max_priority),
        )
        .await
        .map_err(QueueError::Topology)?;

    channel
        .queue_bind(
            queue,
            exchange,
            queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(QueueError::Topology)?;

    info!(
        exchange = exchange,
        queue = queue,
        max_priority = max_priority,
        "rabbitmq_queue_declared"
    );
    Ok(())
}
