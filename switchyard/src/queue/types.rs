//! Message types exchanged with the broker.

use lapin::BasicProperties;

use crate::error::QueueError;
use crate::worker::Request;

/// Content type attached to every request and reply.
pub const CONTENT_TYPE: &str = "application/json";

/// Queue argument that enables per-message priorities.
pub const MAX_PRIORITY_ARGUMENT: &str = "x-max-priority";

/// Where and how to answer a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAddress {
    /// Broker handle used to acknowledge the delivery.
    pub delivery_tag: u64,
    /// Private reply queue of the caller.
    pub reply_to: Option<String>,
    /// Caller-generated id echoed on the reply.
    pub correlation_id: Option<String>,
}

impl ReplyAddress {
    pub fn from_properties(delivery_tag: u64, properties: &BasicProperties) -> Self {
        Self {
            delivery_tag,
            reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
            correlation_id: properties.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        }
    }
}

/// One unit of remote work, alive from delivery until acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub address: ReplyAddress,
    pub body: Request,
}

/// A delivery whose body could not be decoded into a request.
#[derive(Debug)]
pub struct Rejected {
    pub address: ReplyAddress,
    pub error: QueueError,
}

/// Result of decoding a delivery.
pub type Fetched = Result<QueueItem, Rejected>;

impl QueueItem {
    /// Decode a JSON request body. Anything but a JSON object is rejected.
    pub fn decode(address: ReplyAddress, data: &[u8]) -> Fetched {
        match serde_json::from_slice::<Request>(data) {
            Ok(body) => Ok(QueueItem { address, body }),
            Err(e) => Err(Rejected {
                address,
                error: QueueError::Decode(e),
            }),
        }
    }
}
