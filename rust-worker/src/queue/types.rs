//! Queue message and metadata types.
//!
//! This module defines:
//! - `Message`: an inbound job row with its delivery handle
//! - `QueueInfo` / `QueueArguments`: the management API view of a queue
//! - `MessageCountKind` / `MessageCounts`: message count introspection

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::GatewayError;

/// Connection-scoped token needed to ack or reject a fetched message.
///
/// `generation` identifies the connection the message was fetched on. A
/// handle from an earlier generation is stale and can no longer be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub tag: u64,
    pub generation: u64,
}

/// A message as returned by `basic.get`, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

// =============================================================================
// Inbound Message
// =============================================================================

/// An inbound message from a job queue.
///
/// The JSON body is kept verbatim so caller metadata (`rowNumber`,
/// `totalRows`, ...) passes through untouched. Only `email` and `queueName`
/// are required for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Map<String, Value>,
    pub handle: Option<DeliveryHandle>,
}

impl Message {
    /// Create a message with no delivery handle attached.
    pub fn new(payload: Map<String, Value>) -> Self {
        Self {
            payload,
            handle: None,
        }
    }

    /// Decode a raw message body. The body must be a JSON object.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        let payload: Map<String, Value> = serde_json::from_slice(body)?;
        Ok(Self::new(payload))
    }

    pub fn with_handle(mut self, handle: DeliveryHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Email address to validate. Empty strings count as missing.
    pub fn email(&self) -> Option<&str> {
        self.non_empty_str("email")
    }

    /// Name of the results queue the validation result is published to.
    pub fn queue_name(&self) -> Option<&str> {
        self.non_empty_str("queueName")
    }

    pub fn row_number(&self) -> Option<u64> {
        self.payload.get("rowNumber").and_then(Value::as_u64)
    }

    pub fn total_rows(&self) -> Option<u64> {
        self.payload.get("totalRows").and_then(Value::as_u64)
    }

    pub fn delivery_tag(&self) -> Option<u64> {
        self.handle.map(|h| h.tag)
    }

    fn non_empty_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

// =============================================================================
// Management API Types
// =============================================================================

/// Arguments declared on a queue.
///
/// Job queues are created upstream with `row_count` (expected number of
/// rows) and results queues with `jobuid` (originating job). Any other
/// declared argument is preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobuid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A queue as reported by the management API.
///
/// Idle queues may omit the message statistics, so they default to zero.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(default)]
    pub vhost: Option<String>,
    #[serde(default)]
    pub messages_ready: u64,
    #[serde(default)]
    pub messages_unacknowledged: u64,
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub arguments: QueueArguments,
}

impl QueueInfo {
    pub fn count(&self, kind: MessageCountKind) -> u64 {
        match kind {
            MessageCountKind::Ready => self.messages_ready,
            MessageCountKind::Unacked => self.messages_unacknowledged,
            MessageCountKind::Total => self.messages,
        }
    }

    pub fn counts(&self) -> MessageCounts {
        MessageCounts {
            ready: self.messages_ready,
            unacked: self.messages_unacknowledged,
            total: self.messages,
        }
    }
}

/// Which message count to read from the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCountKind {
    /// Ready to be delivered to a consumer
    Ready,
    /// Delivered to a consumer but not yet acknowledged
    Unacked,
    /// Ready plus unacked
    Total,
}

impl MessageCountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCountKind::Ready => "ready",
            MessageCountKind::Unacked => "unacked",
            MessageCountKind::Total => "total",
        }
    }
}

impl fmt::Display for MessageCountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageCountKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(MessageCountKind::Ready),
            "unacked" => Ok(MessageCountKind::Unacked),
            "total" => Ok(MessageCountKind::Total),
            other => Err(GatewayError::InvalidCountKind(other.to_string())),
        }
    }
}

/// Ready, unacked and total counts of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageCounts {
    pub ready: u64,
    pub unacked: u64,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_decode_keeps_metadata() {
        let body = br#"{"email":"a@x.com","queueName":"job-42-results","rowNumber":1,"totalRows":3,"source":"upload.csv"}"#;
        let message = Message::decode(body).unwrap();

        assert_eq!(message.email(), Some("a@x.com"));
        assert_eq!(message.queue_name(), Some("job-42-results"));
        assert_eq!(message.row_number(), Some(1));
        assert_eq!(message.total_rows(), Some(3));
        assert_eq!(message.payload["source"], json!("upload.csv"));
        assert_eq!(message.handle, None);
    }

    #[test]
    fn test_message_decode_rejects_non_object() {
        assert!(Message::decode(b"[1, 2, 3]").is_err());
        assert!(Message::decode(b"not json").is_err());
    }

    #[test]
    fn test_message_empty_fields_count_as_missing() {
        let message = Message::decode(br#"{"email":"","queueName":42}"#).unwrap();
        assert_eq!(message.email(), None);
        assert_eq!(message.queue_name(), None);
    }

    #[test]
    fn test_queue_info_deserialization() {
        let info: QueueInfo = serde_json::from_value(json!({
            "name": "job-42",
            "vhost": "/",
            "messages_ready": 7,
            "messages_unacknowledged": 1,
            "messages": 8,
            "arguments": {"row_count": 10, "jobuid": "abc-123", "x-max-length": 1000},
            "durable": true
        }))
        .unwrap();

        assert_eq!(info.count(MessageCountKind::Ready), 7);
        assert_eq!(info.count(MessageCountKind::Unacked), 1);
        assert_eq!(info.count(MessageCountKind::Total), 8);
        assert_eq!(info.arguments.row_count, Some(10));
        assert_eq!(info.arguments.jobuid.as_deref(), Some("abc-123"));
        assert_eq!(info.arguments.extra["x-max-length"], json!(1000));
    }

    #[test]
    fn test_queue_info_idle_queue_defaults() {
        let info: QueueInfo = serde_json::from_value(json!({"name": "idle"})).unwrap();
        assert_eq!(info.counts(), MessageCounts::default());
        assert_eq!(info.arguments, QueueArguments::default());
    }

    #[test]
    fn test_message_count_kind_parse() {
        assert_eq!("ready".parse::<MessageCountKind>().unwrap(), MessageCountKind::Ready);
        assert_eq!("unacked".parse::<MessageCountKind>().unwrap(), MessageCountKind::Unacked);
        assert_eq!("total".parse::<MessageCountKind>().unwrap(), MessageCountKind::Total);
        assert!(matches!(
            "pending".parse::<MessageCountKind>(),
            Err(GatewayError::InvalidCountKind(kind)) if kind == "pending"
        ));
    }
}
