//! Consumer side of the RPC bridge.
//!
//! A [`QueueWorker`] binds to one priority queue, takes a single
//! unacknowledged delivery at a time, runs it through its worker and
//! publishes the response to the caller's reply queue before acknowledging.
//! Scaling out means running more worker processes on the same queue.
//!
//! Workers with a batch size above one run in batched mode: after the first
//! delivery the loop grabs whatever else is already queued (up to the batch
//! size, without waiting) and processes everything in one call.

use std::future::Future;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, info, warn};

use super::topology::{declare_exchange, declare_worker_queue};
use super::types::{Fetched, QueueItem, ReplyAddress, CONTENT_TYPE};
use crate::error::{ConsumerError, QueueError};
use crate::response::Response;
use crate::worker::{Request, WorkerHandle};

/// Broker settings for a queue worker process.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub url: String,
    pub exchange: String,
    pub queue: String,
    pub max_priority: u8,
}

/// How deliveries are turned into worker calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    /// One delivery, one `process_one` call.
    Single,
    /// Up to this many already-queued deliveries per `process_batch` call.
    Batched(usize),
}

impl ConsumeMode {
    pub fn for_worker(worker: &WorkerHandle) -> Self {
        match worker {
            WorkerHandle::Batched(w) if w.batch_size().get() > 1 => {
                ConsumeMode::Batched(w.batch_size().get())
            }
            _ => ConsumeMode::Single,
        }
    }
}

/// Broker operations the worker loop needs besides the main delivery stream.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Fetch a message that is already queued. Never waits for new ones.
    async fn try_fetch(&self) -> Result<Option<Fetched>, QueueError>;

    /// Publish `response` to the caller and acknowledge the delivery.
    async fn respond(&self, address: &ReplyAddress, response: &Response) -> Result<(), QueueError>;
}

/// [`WorkQueue`] backed by a lapin channel.
pub struct AmqpWorkQueue {
    channel: Channel,
    queue: String,
}

impl AmqpWorkQueue {
    pub fn new(channel: Channel, queue: impl Into<String>) -> Self {
        Self {
            channel,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl WorkQueue for AmqpWorkQueue {
    async fn try_fetch(&self) -> Result<Option<Fetched>, QueueError> {
        let message = self
            .channel
            .basic_get(&self.queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(QueueError::Consume)?;

        Ok(message.map(|message| {
            let delivery = message.delivery;
            let address = ReplyAddress::from_properties(delivery.delivery_tag, &delivery.properties);
            QueueItem::decode(address, &delivery.data)
        }))
    }

    async fn respond(&self, address: &ReplyAddress, response: &Response) -> Result<(), QueueError> {
        match &address.reply_to {
            Some(reply_to) => {
                let body = response.encode()?;
                let mut properties =
                    BasicProperties::default().with_content_type(CONTENT_TYPE.into());
                if let Some(correlation_id) = &address.correlation_id {
                    properties = properties.with_correlation_id(correlation_id.as_str().into());
                }

                self.channel
                    .basic_publish(
                        "",
                        reply_to,
                        BasicPublishOptions::default(),
                        &body,
                        properties,
                    )
                    .await
                    .map_err(QueueError::Publish)?
                    .await
                    .map_err(QueueError::Publish)?;
            }
            None => {
                warn!(
                    delivery_tag = address.delivery_tag,
                    "queue_worker_reply_to_missing"
                );
            }
        }

        self.channel
            .basic_ack(address.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|source| QueueError::Ack {
                delivery_tag: address.delivery_tag,
                source,
            })
    }
}

/// Serves one worker from one queue.
pub struct QueueWorker {
    worker: WorkerHandle,
    mode: ConsumeMode,
}

impl QueueWorker {
    pub fn new(worker: WorkerHandle) -> Self {
        let mode = ConsumeMode::for_worker(&worker);
        Self { worker, mode }
    }

    pub fn mode(&self) -> ConsumeMode {
        self.mode
    }

    /// Handle one delivery, plus any extra deliveries drained in batched mode.
    ///
    /// Every message is answered and acknowledged individually once its
    /// response exists. Returns the number of requests the worker processed.
    pub async fn handle<Q>(&self, first: Fetched, queue: &Q) -> Result<usize, ConsumerError>
    where
        Q: WorkQueue + ?Sized,
    {
        let started = Instant::now();

        let mut fetched = vec![first];
        if let ConsumeMode::Batched(batch_size) = self.mode {
            while fetched.len() < batch_size {
                match queue.try_fetch().await? {
                    Some(next) => fetched.push(next),
                    None => break,
                }
            }
        }

        let mut addresses = Vec::with_capacity(fetched.len());
        let mut requests: Vec<Request> = Vec::with_capacity(fetched.len());
        for item in fetched {
            match item {
                Ok(item) => {
                    addresses.push(item.address);
                    requests.push(item.body);
                }
                Err(rejected) => {
                    warn!(
                        delivery_tag = rejected.address.delivery_tag,
                        error = %rejected.error,
                        "queue_worker_request_malformed"
                    );
                    let response =
                        Response::error(400, format!("Malformed request body: {}", rejected.error));
                    queue.respond(&rejected.address, &response).await?;
                }
            }
        }

        if requests.is_empty() {
            return Ok(0);
        }

        let processed = requests.len();
        let responses = match self.mode {
            ConsumeMode::Single => {
                let mut responses = Vec::with_capacity(processed);
                for request in requests {
                    responses.push(self.worker.process_one(request).await?);
                }
                responses
            }
            ConsumeMode::Batched(_) => self.worker.process_batch(requests).await?,
        };

        for (address, response) in addresses.iter().zip(&responses) {
            queue.respond(address, response).await?;
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            batch_size = processed,
            "queue_worker_batch_processed"
        );

        Ok(processed)
    }

    /// Run the worker loop until `shutdown` resolves or the broker closes
    /// the delivery stream.
    ///
    /// This function:
    /// 1. Connects to RabbitMQ and opens a channel
    /// 2. Declares the exchange and the priority queue, bound under its own name
    /// 3. Limits the channel to one unacknowledged delivery
    /// 4. Handles deliveries one at a time
    pub async fn run<F>(&self, settings: &ConsumerSettings, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(url_length = settings.url.len(), "rabbitmq_connecting");

        let conn = Connection::connect(&settings.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_connected");

        let channel = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        declare_exchange(&channel, &settings.exchange)
            .await
            .context("Failed to declare exchange")?;
        declare_worker_queue(
            &channel,
            &settings.exchange,
            &settings.queue,
            settings.max_priority,
        )
        .await
        .context("Failed to declare queue")?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("Failed to set QoS")?;

        info!(prefetch_count = 1, "rabbitmq_qos_set");

        let mut consumer = channel
            .basic_consume(
                &settings.queue,
                "switchyard-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consumer")?;

        let work_queue = AmqpWorkQueue::new(channel, settings.queue.clone());

        match self.mode {
            ConsumeMode::Single => info!(queue = %settings.queue, "queue_worker_ready"),
            ConsumeMode::Batched(batch_size) => info!(
                queue = %settings.queue,
                batch_size = batch_size,
                "queue_worker_ready_batched"
            ),
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("queue_worker_stopping");
                    break;
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let address =
                                ReplyAddress::from_properties(delivery.delivery_tag, &delivery.properties);

                            debug!(
                                queue = %settings.queue,
                                delivery_tag = address.delivery_tag,
                                correlation_id = ?address.correlation_id,
                                "queue_worker_request_received"
                            );

                            let fetched = QueueItem::decode(address, &delivery.data);
                            if let Err(e) = self.handle(fetched, &work_queue).await {
                                error!(queue = %settings.queue, error = %e, "queue_worker_failed");
                                return Err(e).context("Queue worker stopped");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!("rabbitmq_consumer_closed");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = conn.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }

        info!("queue_worker_shutdown_complete");
        Ok(())
    }
}
