//! Response envelope shared by workers, the queue and the HTTP layer.
//!
//! On the wire an envelope is a flat JSON object:
//!
//! ```text
//! {"content": ..., "http_status_code": 200, "mimetype": "application/json"}
//! ```
//!
//! Binary payloads travel as Latin-1 text (one char per byte) and are turned
//! back into raw bytes on decode whenever the envelope is a success with a
//! non-JSON mimetype.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response as HttpResponse},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::QueueError;

/// Mimetype for structured payloads.
pub const JSON_MIMETYPE: &str = "application/json";

/// Envelope payload. The variants are mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

/// Uniform result of a worker call.
///
/// When `http_status_code` is not a success code, `content` is a
/// human-readable message rather than data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireResponse", into = "WireResponse")]
pub struct Response {
    pub content: Option<Content>,
    pub http_status_code: u16,
    pub mimetype: String,
}

impl Response {
    /// Successful structured response.
    pub fn json(content: Value) -> Self {
        Self {
            content: Some(Content::Json(content)),
            http_status_code: 200,
            mimetype: JSON_MIMETYPE.to_string(),
        }
    }

    /// Successful binary response with the given mimetype.
    pub fn bytes(content: Vec<u8>, mimetype: impl Into<String>) -> Self {
        Self {
            content: Some(Content::Bytes(content)),
            http_status_code: 200,
            mimetype: mimetype.into(),
        }
    }

    /// Failed response carrying a message for the caller.
    pub fn error(http_status_code: u16, message: impl Into<String>) -> Self {
        Self {
            content: Some(Content::Text(message.into())),
            http_status_code,
            mimetype: JSON_MIMETYPE.to_string(),
        }
    }

    /// Failed response without a message.
    pub fn empty_error(http_status_code: u16) -> Self {
        Self {
            content: None,
            http_status_code,
            mimetype: JSON_MIMETYPE.to_string(),
        }
    }

    /// Any 2xx status counts as success, not only 200.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_status_code)
    }

    pub fn is_json(&self) -> bool {
        self.mimetype == JSON_MIMETYPE
    }

    /// Encode the envelope for transport over the queue.
    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(QueueError::Encode)
    }

    /// Decode an envelope received from the queue.
    pub fn decode(body: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(body).map_err(QueueError::Decode)
    }

    fn message(&self) -> Option<Value> {
        match &self.content {
            None => None,
            Some(Content::Text(text)) => Some(Value::String(text.clone())),
            Some(Content::Json(value)) => Some(value.clone()),
            Some(Content::Bytes(bytes)) => {
                Some(Value::String(String::from_utf8_lossy(bytes).into_owned()))
            }
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self {
            content: None,
            http_status_code: 200,
            mimetype: JSON_MIMETYPE.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default = "default_status")]
    http_status_code: u16,
    #[serde(default = "default_mimetype")]
    mimetype: String,
}

fn default_status() -> u16 {
    200
}

fn default_mimetype() -> String {
    JSON_MIMETYPE.to_string()
}

impl From<Response> for WireResponse {
    fn from(response: Response) -> Self {
        let content = response.content.map(|content| match content {
            Content::Json(value) => value,
            Content::Text(text) => Value::String(text),
            Content::Bytes(bytes) => Value::String(latin1_encode(&bytes)),
        });

        WireResponse {
            content,
            http_status_code: response.http_status_code,
            mimetype: response.mimetype,
        }
    }
}

impl From<WireResponse> for Response {
    fn from(wire: WireResponse) -> Self {
        let success = (200..300).contains(&wire.http_status_code);
        let binary = wire.mimetype != JSON_MIMETYPE;

        let content = wire.content.map(|value| match value {
            Value::String(text) if success && binary => match latin1_decode(&text) {
                Some(bytes) => Content::Bytes(bytes),
                None => Content::Text(text),
            },
            Value::String(text) if !success => Content::Text(text),
            other => Content::Json(other),
        });

        Response {
            content,
            http_status_code: wire.http_status_code,
            mimetype: wire.mimetype,
        }
    }
}

fn latin1_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Returns `None` if the text holds a char outside the single-byte range.
fn latin1_decode(text: &str) -> Option<Vec<u8>> {
    text.chars().map(|c| u8::try_from(c).ok()).collect()
}

impl IntoResponse for Response {
    fn into_response(self) -> HttpResponse {
        let status =
            StatusCode::from_u16(self.http_status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if !self.is_success() {
            return match self.message() {
                Some(message) => (status, Json(json!({ "message": message }))).into_response(),
                None => status.into_response(),
            };
        }

        if self.is_json() {
            let body = match self.content {
                Some(Content::Json(value)) => value,
                Some(Content::Text(text)) => Value::String(text),
                Some(Content::Bytes(bytes)) => Value::String(latin1_encode(&bytes)),
                None => Value::Null,
            };
            return (status, Json(body)).into_response();
        }

        let body = match self.content {
            Some(Content::Bytes(bytes)) => bytes,
            Some(Content::Text(text)) => text.into_bytes(),
            Some(Content::Json(value)) => value.to_string().into_bytes(),
            None => Vec::new(),
        };

        (status, [(header::CONTENT_TYPE, self.mimetype)], body).into_response()
    }
}
