//! Wire frames
//!
//! Every message on a link is one JSON envelope:
//! `{ "type": "...", "id"?: "...", "payload": {...}, "timestamp": <epoch ms> }`.
//! `id` correlates command/ack pairs and is absent on fire-and-forget events.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tether_core::session::{ChannelKind, Role, SessionId};

use crate::command::CommandKind;
use crate::nodes::{Capability, NodeId};
use crate::{GatewayError, Result};

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    #[serde(rename = "session.message")]
    SessionMessage,
    #[serde(rename = "session.event")]
    SessionEvent,
    #[serde(rename = "session.context")]
    SessionContext,
    #[serde(rename = "session.close")]
    SessionClose,
    #[serde(rename = "session.ack")]
    SessionAck,
    #[serde(rename = "node.register")]
    NodeRegister,
    #[serde(rename = "node.registered")]
    NodeRegistered,
    #[serde(rename = "node.heartbeat")]
    NodeHeartbeat,
    #[serde(rename = "node.capabilities")]
    NodeCapabilities,
    #[serde(rename = "node.deregister")]
    NodeDeregister,
    #[serde(rename = "command.dispatch")]
    CommandDispatch,
    #[serde(rename = "command.ack")]
    CommandAck,
    #[serde(rename = "command.confirm")]
    CommandConfirm,
    #[serde(rename = "command.reject")]
    CommandReject,
    #[serde(rename = "command.result")]
    CommandResult,
    #[serde(rename = "command.pending_confirmation")]
    CommandPendingConfirmation,
    #[serde(rename = "error")]
    Error,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::SessionMessage => "session.message",
            FrameType::SessionEvent => "session.event",
            FrameType::SessionContext => "session.context",
            FrameType::SessionClose => "session.close",
            FrameType::SessionAck => "session.ack",
            FrameType::NodeRegister => "node.register",
            FrameType::NodeRegistered => "node.registered",
            FrameType::NodeHeartbeat => "node.heartbeat",
            FrameType::NodeCapabilities => "node.capabilities",
            FrameType::NodeDeregister => "node.deregister",
            FrameType::CommandDispatch => "command.dispatch",
            FrameType::CommandAck => "command.ack",
            FrameType::CommandConfirm => "command.confirm",
            FrameType::CommandReject => "command.reject",
            FrameType::CommandResult => "command.result",
            FrameType::CommandPendingConfirmation => "command.pending_confirmation",
            FrameType::Error => "error",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,

    /// Unix epoch milliseconds
    #[serde(default = "now_ms")]
    pub timestamp: i64,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: serde_json::Value) -> Self {
        Self {
            frame_type,
            id: None,
            payload,
            timestamp: now_ms(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Structured `error` frame, echoing the offending frame's id if any
    pub fn error(err: &GatewayError, id: Option<String>) -> Self {
        Self {
            frame_type: FrameType::Error,
            id,
            payload: err.to_payload(),
            timestamp: now_ms(),
        }
    }

    /// Parse a text frame. A `null` payload is read as `{}`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut frame: Frame =
            serde_json::from_str(text).map_err(|e| GatewayError::InvalidFrame(e.to_string()))?;
        if frame.payload.is_null() {
            frame.payload = empty_payload();
        }
        if !frame.payload.is_object() {
            return Err(GatewayError::InvalidFrame(format!(
                "payload of {} must be an object",
                frame.frame_type
            )));
        }
        Ok(frame)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize the payload into a typed body
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            GatewayError::InvalidFrame(format!("bad {} payload: {}", self.frame_type, e))
        })
    }
}

/// `session.message`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessagePayload {
    /// Omitted on first contact; the gateway creates a session
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub channel_kind: ChannelKind,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub importance: Option<f32>,
    /// Exact count from the caller's tokenizer; estimated when absent
    #[serde(default)]
    pub token_count: Option<u32>,
}

/// `session.event`: an opaque perception event recorded as a tool message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventPayload {
    pub session_id: String,
    pub event: serde_json::Value,
}

/// `session.context` and `session.close` requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

/// `node.heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub node_id: NodeId,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// `node.capabilities`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesPayload {
    pub node_id: NodeId,
    pub capabilities: Vec<Capability>,
}

/// `node.deregister`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub node_id: NodeId,
}

/// Client-originated `command.dispatch`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    pub kind: CommandKind,
    /// `node:<id>`, `capability:<name>` or `session:<id>`
    pub target: String,
    #[serde(default = "empty_payload")]
    pub args: serde_json::Value,
}

/// `command.ack`. Exactly one of `result` and `error` is expected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `command.confirm` and `command.reject`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRef {
    pub command_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Namespace a client-supplied session id
pub fn session_id(raw: &str) -> SessionId {
    if raw.starts_with("session:") {
        SessionId::from_str(raw)
    } else {
        SessionId(format!("session:{}", raw))
    }
}
