//! Wire message envelope and its codec.
//!
//! The envelope is a JSON object:
//! `{ id, type, timestamp, workflowId?, nodeId?, data, version? }`.
//! Decoding validates the shape and rewrites `timestamp` to receipt time; anything that
//! does not validate is a protocol error which callers log and drop.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonic_rs::{JsonValueTrait, Value};

use super::error::{RealtimeError, RealtimeResult};
use super::frame::TransportFrame;

/// Tagged message variants carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    StatusUpdate,
    ProgressUpdate,
    Error,
    Result,
    Metadata,
    Log,
    Event,
    Ping,
    Pong,
    SubscriptionAck,
    SubscriptionError,
}

impl MessageType {
    pub const ALL: [MessageType; 11] = [
        MessageType::StatusUpdate,
        MessageType::ProgressUpdate,
        MessageType::Error,
        MessageType::Result,
        MessageType::Metadata,
        MessageType::Log,
        MessageType::Event,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::SubscriptionAck,
        MessageType::SubscriptionError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::StatusUpdate => "status_update",
            MessageType::ProgressUpdate => "progress_update",
            MessageType::Error => "error",
            MessageType::Result => "result",
            MessageType::Metadata => "metadata",
            MessageType::Log => "log",
            MessageType::Event => "event",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::SubscriptionAck => "subscription_ack",
            MessageType::SubscriptionError => "subscription_error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    #[inline]
    pub fn is_heartbeat(self) -> bool {
        matches!(self, MessageType::Ping | MessageType::Pong)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable message envelope.
///
/// Constructed by the sender (from an [`OutboundMessage`]) or by the codec on receipt.
/// Subscribers only ever see `&Message`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    id: String,
    #[serde(rename = "type")]
    kind: MessageType,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
}

impl Message {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.workflow_id.as_deref()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Heartbeat ping carrying `ping_id` as `data.pingId` (and `data.ping`).
    pub fn ping(ping_id: &str) -> Self {
        Self::heartbeat(MessageType::Ping, ping_id)
    }

    /// Heartbeat pong echoing `ping_id`.
    pub fn pong(ping_id: &str) -> Self {
        Self::heartbeat(MessageType::Pong, ping_id)
    }

    fn heartbeat(kind: MessageType, ping_id: &str) -> Self {
        OutboundMessage::new(kind, sonic_rs::json!({ "pingId": ping_id, "ping": ping_id }))
            .into_message(Utc::now())
    }

    /// Heartbeat token of a ping/pong, read from `data.pingId` or `data.ping`.
    pub fn ping_id(&self) -> Option<&str> {
        if !self.kind.is_heartbeat() {
            return None;
        }
        self.data
            .get("pingId")
            .and_then(|v| v.as_str())
            .or_else(|| self.data.get("ping").and_then(|v| v.as_str()))
    }
}

/// Partial message accepted by `send_message`; `id`, `timestamp` and `version` are
/// filled in when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub kind: MessageType,
    pub data: Value,
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
    pub id: Option<String>,
    pub version: Option<u64>,
}

impl OutboundMessage {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind,
            data,
            workflow_id: None,
            node_id: None,
            id: None,
            version: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Fill defaults and freeze into a [`Message`].
    pub fn into_message(self, now: DateTime<Utc>) -> Message {
        let data = if self.data.is_null() {
            empty_object()
        } else {
            self.data
        };
        Message {
            id: self.id.unwrap_or_else(generate_message_id),
            kind: self.kind,
            timestamp: now,
            workflow_id: self.workflow_id,
            node_id: self.node_id,
            data,
            version: Some(self.version.unwrap_or(1)),
        }
    }
}

pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn empty_object() -> Value {
    sonic_rs::json!({})
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    timestamp: Option<String>,
    workflow_id: Option<String>,
    node_id: Option<String>,
    data: Option<Value>,
    version: Option<u64>,
}

/// Serializes and validates the wire envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode(&self, message: &Message) -> RealtimeResult<TransportFrame> {
        sonic_rs::to_string(message)
            .map(TransportFrame::text)
            .map_err(|err| RealtimeError::Protocol(format!("encode failed: {err}")))
    }

    /// Decode and validate an inbound payload, stamping it with `received_at`.
    pub fn decode(&self, payload: &[u8], received_at: DateTime<Utc>) -> RealtimeResult<Message> {
        let raw: RawEnvelope = sonic_rs::from_slice(payload)
            .map_err(|err| RealtimeError::Protocol(format!("malformed envelope: {err}")))?;

        let id = match raw.id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(RealtimeError::Protocol("missing message id".to_string())),
        };
        let kind_raw = raw
            .kind
            .ok_or_else(|| RealtimeError::Protocol(format!("message {id} has no type")))?;
        let kind = MessageType::parse(&kind_raw).ok_or_else(|| {
            RealtimeError::Protocol(format!("message {id} has unknown type {kind_raw:?}"))
        })?;
        if let Some(ts) = raw.timestamp.as_deref()
            && DateTime::parse_from_rfc3339(ts).is_err()
        {
            return Err(RealtimeError::Protocol(format!(
                "message {id} has invalid timestamp {ts:?}"
            )));
        }
        let data = match raw.data {
            None => empty_object(),
            Some(value) if value.is_null() => empty_object(),
            Some(value) if value.is_object() => value,
            Some(_) => {
                return Err(RealtimeError::Protocol(format!(
                    "message {id} data must be an object"
                )));
            }
        };

        Ok(Message {
            id,
            kind,
            timestamp: received_at,
            workflow_id: raw.workflow_id,
            node_id: raw.node_id,
            data,
            version: raw.version,
        })
    }
}
