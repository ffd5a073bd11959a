//! Error types shared by the dispatcher, the queue client and the queue worker.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response as HttpResponse},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors raised by a [`Worker`](crate::worker::Worker) that were not turned
/// into a [`Response`](crate::Response) by the worker itself.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("batch size must be at least 1, got {0}")]
    InvalidBatchSize(usize),

    #[error("batch produced {actual} responses for {expected} requests")]
    BatchLengthMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Broker-side failures. None of these are retried.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to broker: {0}")]
    Connection(#[source] lapin::Error),

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare topology: {0}")]
    Topology(#[source] lapin::Error),

    #[error("failed to publish message: {0}")]
    Publish(#[source] lapin::Error),

    #[error("failed to consume: {0}")]
    Consume(#[source] lapin::Error),

    #[error("failed to acknowledge delivery {delivery_tag}: {source}")]
    Ack {
        delivery_tag: u64,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("reply channel closed before all replies arrived")]
    ReplyChannelClosed,

    #[error("reply for correlation id {0} could not be decoded")]
    MalformedReply(String),
}

/// Failures that stop a queue worker loop.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Invalid dispatcher configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_priority must be between 1 and 255, got {0}")]
    InvalidMaxPriority(u32),

    #[error("max_length must be positive")]
    InvalidMaxLength,

    #[error("no tokens configured")]
    NoTokens,

    #[error("route must start with '/' and must not be /health, got {0:?}")]
    InvalidRoute(String),
}

/// Request-level failures surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid authentication token.")]
    Unauthorized,

    #[error("The {unit} is too long ({length} {measure}).")]
    PayloadTooLarge {
        length: usize,
        unit: &'static str,
        measure: &'static str,
    },

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl DispatchError {
    /// Payload-too-large error for a single text measured in characters.
    pub fn text_too_long(length: usize) -> Self {
        DispatchError::PayloadTooLarge {
            length,
            unit: "text",
            measure: "characters",
        }
    }

    /// Payload-too-large error for a request measured in subrequests.
    pub fn request_too_long(length: usize) -> Self {
        DispatchError::PayloadTooLarge {
            length,
            unit: "request",
            measure: "elements",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Worker(_) | DispatchError::Queue(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> HttpResponse {
        let status = self.status_code();

        // Internal failures are logged in full but not echoed to callers.
        let message = if status.is_server_error() {
            error!(error = %self, "dispatch_failed");
            "Internal server error.".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_too_large_messages() {
        assert_eq!(
            DispatchError::text_too_long(20001).to_string(),
            "The text is too long (20001 characters)."
        );
        assert_eq!(
            DispatchError::request_too_long(42).to_string(),
            "The request is too long (42 elements)."
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(DispatchError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            DispatchError::text_too_long(1).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            DispatchError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DispatchError::Queue(QueueError::ReplyChannelClosed).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
