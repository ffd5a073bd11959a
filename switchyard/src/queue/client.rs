//! Producer side of the RPC bridge.
//!
//! A [`QueueClient`] shares one lazily-opened broker connection across
//! requests. Every logical call opens its own channel and exclusive reply
//! queue, publishes one message per request with a fresh correlation id,
//! and waits until every id has been answered:
//!
//! ```text
//! publish(id_1..id_n) ──► worker queue ──► workers ──► reply queue
//!                                                         │
//!                                   reply reader ◄────────┘
//!                                        │ oneshot per id
//! wait() ◄── responses in publish order ─┘
//! ```
//!
//! There is no timeout: a worker that never replies keeps the caller waiting.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::topology::{declare_exchange, declare_worker_queue};
use super::types::CONTENT_TYPE;
use crate::error::QueueError;
use crate::response::Response;
use crate::worker::Request;

type ReplySlot = Result<Response, QueueError>;

/// Reply as seen by the reply reader.
#[derive(Debug, Clone)]
pub struct Reply {
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

/// Correlation ids of one logical call that are still waiting for a reply.
///
/// Each id is answered at most once; later replies with the same id are
/// dropped.
#[derive(Debug)]
pub struct CorrelationTable {
    pending: HashMap<String, oneshot::Sender<ReplySlot>>,
}

/// Receiving half of a [`CorrelationTable`], kept in publish order.
#[derive(Debug)]
pub struct PendingReplies {
    receivers: Vec<oneshot::Receiver<ReplySlot>>,
}

impl CorrelationTable {
    pub fn register<I>(correlation_ids: I) -> (Self, PendingReplies)
    where
        I: IntoIterator<Item = String>,
    {
        let mut pending = HashMap::new();
        let mut receivers = Vec::new();

        for correlation_id in correlation_ids {
            let (tx, rx) = oneshot::channel();
            pending.insert(correlation_id, tx);
            receivers.push(rx);
        }

        (Self { pending }, PendingReplies { receivers })
    }

    /// Route a reply body to the caller waiting on `correlation_id`.
    ///
    /// Returns `false` when the reply matched nothing still pending.
    pub fn deliver(&mut self, correlation_id: Option<&str>, body: &[u8]) -> bool {
        let Some(correlation_id) = correlation_id else {
            warn!("rpc_reply_missing_correlation_id");
            return false;
        };

        let Some(sender) = self.pending.remove(correlation_id) else {
            debug!(correlation_id = %correlation_id, "rpc_reply_unmatched");
            return false;
        };

        let reply = Response::decode(body).map_err(|e| {
            warn!(correlation_id = %correlation_id, error = %e, "rpc_reply_malformed");
            QueueError::MalformedReply(correlation_id.to_string())
        });

        // The caller may already have given up; nothing to do then.
        let _ = sender.send(reply);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

impl PendingReplies {
    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Wait for every reply and return them in registration order.
    pub async fn wait(self) -> Result<Vec<Response>, QueueError> {
        let mut responses = Vec::with_capacity(self.receivers.len());
        for receiver in self.receivers {
            let reply = receiver.await.map_err(|_| QueueError::ReplyChannelClosed)?;
            responses.push(reply?);
        }
        Ok(responses)
    }
}

/// Feed replies into `table` until every id is answered or the stream ends.
///
/// Dropping the table on exit wakes any caller still waiting with
/// [`QueueError::ReplyChannelClosed`].
pub async fn read_replies<S, E>(mut replies: S, mut table: CorrelationTable)
where
    S: Stream<Item = Result<Reply, E>> + Unpin,
    E: Display,
{
    while !table.is_complete() {
        match replies.next().await {
            Some(Ok(reply)) => {
                table.deliver(reply.correlation_id.as_deref(), &reply.body);
            }
            Some(Err(e)) => {
                warn!(error = %e, "rpc_reply_stream_error");
                break;
            }
            None => {
                warn!("rpc_reply_stream_closed");
                break;
            }
        }
    }
}

/// RPC client for worker queues behind a direct exchange.
#[derive(Clone)]
pub struct QueueClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: String,
    exchange: String,
    connection: RwLock<Option<Connection>>,
}

impl QueueClient {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                url: url.into(),
                exchange: exchange.into(),
                connection: RwLock::new(None),
            }),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// Open a fresh channel, reconnecting first if the connection is gone.
    async fn open_channel(&self) -> Result<Channel, QueueError> {
        {
            let connection = self.inner.connection.read().await;
            if let Some(conn) = connection.as_ref() {
                if conn.status().connected() {
                    return conn.create_channel().await.map_err(QueueError::Channel);
                }
            }
        }

        let mut connection = self.inner.connection.write().await;

        // Another task may have reconnected while we waited for the lock.
        if let Some(conn) = connection.as_ref() {
            if conn.status().connected() {
                return conn.create_channel().await.map_err(QueueError::Channel);
            }
        }

        info!("rabbitmq_client_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .map_err(QueueError::Connection)?;

        info!("rabbitmq_client_connected");

        let channel = conn.create_channel().await.map_err(QueueError::Channel)?;
        *connection = Some(conn);

        Ok(channel)
    }

    /// Declare the exchange and every worker queue.
    pub async fn declare_topology<I, S>(&self, queues: I, max_priority: u8) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channel = self.open_channel().await?;
        declare_exchange(&channel, &self.inner.exchange).await?;
        for queue in queues {
            declare_worker_queue(&channel, &self.inner.exchange, queue.as_ref(), max_priority)
                .await?;
        }
        close_channel(channel).await;
        Ok(())
    }

    /// Publish one request and wait for its reply.
    pub async fn call(
        &self,
        queue: &str,
        request: &Request,
        priority: u8,
    ) -> Result<Response, QueueError> {
        let mut responses = self
            .call_many(queue, std::slice::from_ref(request), priority)
            .await?;
        responses.pop().ok_or(QueueError::ReplyChannelClosed)
    }

    /// Publish every request and wait until all of them are answered.
    ///
    /// Responses come back in the order of `requests`, whatever order the
    /// replies arrive in.
    pub async fn call_many(
        &self,
        queue: &str,
        requests: &[Request],
        priority: u8,
    ) -> Result<Vec<Response>, QueueError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let channel = self.open_channel().await?;
        let result = match RpcCall::open(&channel).await {
            Ok(call) => call.run(&self.inner.exchange, queue, requests, priority).await,
            Err(e) => Err(e),
        };
        close_channel(channel).await;

        result
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_client_closed");
    }
}

/// Properties of a published request: where to reply, how to correlate the
/// reply, and the queue priority.
pub fn request_properties(reply_to: &str, correlation_id: &str, priority: u8) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_reply_to(reply_to.into())
        .with_correlation_id(correlation_id.into())
        .with_priority(priority)
}

async fn close_channel(channel: Channel) {
    if let Err(e) = channel.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_channel_close_error");
    }
}

/// State of one logical call. Never reused.
struct RpcCall<'a> {
    channel: &'a Channel,
    reply_queue: String,
}

impl<'a> RpcCall<'a> {
    async fn open(channel: &'a Channel) -> Result<RpcCall<'a>, QueueError> {
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::Topology)?;

        Ok(Self {
            channel,
            reply_queue: queue.name().as_str().to_string(),
        })
    }

    async fn run(
        self,
        exchange: &str,
        queue: &str,
        requests: &[Request],
        priority: u8,
    ) -> Result<Vec<Response>, QueueError> {
        let correlation_ids: Vec<String> = requests
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        let (table, pending) = CorrelationTable::register(correlation_ids.clone());

        // Consume before publishing so no reply can slip past the reader.
        let consumer = self
            .channel
            .basic_consume(
                &self.reply_queue,
                &format!("rpc-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::Consume)?;

        let replies = consumer.map(|delivery| {
            delivery.map(|delivery| Reply {
                correlation_id: delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|s| s.as_str().to_string()),
                body: delivery.data,
            })
        });
        let reader = tokio::spawn(read_replies(replies, table));

        let result = async {
            for (request, correlation_id) in requests.iter().zip(&correlation_ids) {
                self.publish(exchange, queue, request, correlation_id, priority)
                    .await?;
            }

            info!(
                queue = queue,
                requests = requests.len(),
                priority = priority,
                reply_queue = %self.reply_queue,
                "rpc_call_published"
            );

            pending.wait().await
        }
        .await;

        reader.abort();

        if result.is_ok() {
            info!(queue = queue, replies = requests.len(), "rpc_call_completed");
        }
        result
    }

    async fn publish(
        &self,
        exchange: &str,
        queue: &str,
        request: &Request,
        correlation_id: &str,
        priority: u8,
    ) -> Result<(), QueueError> {
        let body = serde_json::to_vec(request).map_err(QueueError::Encode)?;

        self.channel
            .basic_publish(
                exchange,
                queue,
                BasicPublishOptions::default(),
                &body,
                request_properties(&self.reply_queue, correlation_id, priority),
            )
            .await
            .map_err(QueueError::Publish)?
            .await
            .map_err(QueueError::Publish)?;

        debug!(
            queue = queue,
            correlation_id = %correlation_id,
            body_length = body.len(),
            "rpc_request_published"
        );

        Ok(())
    }
}
