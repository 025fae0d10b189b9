//! Channel wire frames.
//!
//! Frames travel as JSON arrays in the V2 serializer layout:
//! `[join_ref, ref, topic, event, payload]`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version advertised in the connect query string.
pub const PROTOCOL_VSN: &str = "2.0.0";
/// Reserved topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Server push carrying a full document update.
pub const EVENT_DOCUMENT_UPDATED: &str = "document_updated";
/// Server push carrying processing progress.
pub const EVENT_STATUS_UPDATED: &str = "status_updated";
/// Client request for the current processing status.
pub const EVENT_GET_STATUS: &str = "get_status";
/// Client liveness probe answered by the channel.
pub const EVENT_PING: &str = "ping";

#[derive(Serialize, Deserialize)]
struct WireFrame(Option<String>, Option<String>, String, String, Value);

/// A single message exchanged over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireFrame", into = "WireFrame")]
pub struct Frame {
    /// Ref of the join that created the sending/receiving channel.
    pub join_ref: Option<String>,
    /// Correlation ref; replies echo the ref of the push they answer.
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl From<WireFrame> for Frame {
    fn from(WireFrame(join_ref, msg_ref, topic, event, payload): WireFrame) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        }
    }
}

impl From<Frame> for WireFrame {
    fn from(frame: Frame) -> Self {
        WireFrame(
            frame.join_ref,
            frame.msg_ref,
            frame.topic,
            frame.event,
            frame.payload,
        )
    }
}

impl Frame {
    /// Builds a channel join request. The join ref doubles as the message ref.
    pub fn join(topic: &str, join_ref: &str, payload: Value) -> Self {
        Self {
            join_ref: Some(join_ref.to_string()),
            msg_ref: Some(join_ref.to_string()),
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload,
        }
    }

    /// Builds a channel leave request.
    pub fn leave(topic: &str, join_ref: &str, msg_ref: String) -> Self {
        Self::push(topic, join_ref, msg_ref, EVENT_LEAVE, Value::Object(Default::default()))
    }

    /// Builds a client push for an arbitrary channel event.
    pub fn push(topic: &str, join_ref: &str, msg_ref: String, event: &str, payload: Value) -> Self {
        Self {
            join_ref: Some(join_ref.to_string()),
            msg_ref: Some(msg_ref),
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        }
    }

    /// Builds a socket heartbeat.
    pub fn heartbeat(msg_ref: String) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref),
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: Value::Object(Default::default()),
        }
    }

    /// Builds a reply frame answering `request`.
    pub fn reply_to(request: &Frame, status: ReplyStatus, response: Value) -> Self {
        let payload = serde_json::json!({ "status": status, "response": response });
        Self {
            join_ref: request.join_ref.clone(),
            msg_ref: request.msg_ref.clone(),
            topic: request.topic.clone(),
            event: EVENT_REPLY.to_string(),
            payload,
        }
    }

    /// Builds a server-initiated broadcast with no refs.
    pub fn broadcast(topic: &str, event: &str, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        }
    }

    /// Decodes the payload of a `phx_reply` frame.
    ///
    /// Returns `None` for any other event or for a malformed reply payload.
    pub fn as_reply(&self) -> Option<Reply> {
        if self.event != EVENT_REPLY {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Decoded `phx_reply` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    /// Maps the reply into the settled value of a push.
    pub fn into_result(self) -> Result<Value, Value> {
        match self.status {
            ReplyStatus::Ok => Ok(self.response),
            ReplyStatus::Error => Err(self.response),
        }
    }
}

/// Socket-wide generator for message refs.
#[derive(Clone, Debug, Default)]
pub(crate) struct RefCounter(Arc<AtomicU64>);

impl RefCounter {
    pub(crate) fn next(&self) -> String {
        (self.0.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}
