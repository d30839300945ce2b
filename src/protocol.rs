//! Control channel wire messages
//!
//! Every frame is a JSON text message discriminated by its `type` field:
//!
//! ```text
//! gateway → central   {"type": "heartbeat", "gatewayId", "queueDepth", "timestamp", ...}
//! gateway → central   {"type": "ack", "commandId", "status", "error"?, "timestamp"}
//! central → gateway   {"type": "command", "command": {"id", "type", "payload", "requiresAck"?}}
//! central → gateway   {"type": "heartbeat-ack", ...}
//! ```
//!
//! Inbound frames are never trusted to be well formed: [`classify`] turns any
//! text into an [`InboundMessage`] without failing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Periodic liveness report sent to the central service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub gateway_id: String,
    pub queue_depth: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, Value>,
}

/// A command pushed by the central service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub requires_ack: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// Answer to a command that asked for one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub command_id: String,
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AckPayload {
    pub fn accepted(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Accepted,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn rejected(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Rejected,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Frames the gateway sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    Heartbeat(HeartbeatPayload),
    Ack(AckPayload),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// The central service acknowledged a heartbeat
    HeartbeatAck,

    Command(CommandEnvelope),

    /// A `command` frame whose envelope could not be decoded
    MalformedCommand {
        id: Option<String>,
        requires_ack: bool,
        reason: String,
    },

    /// The central service acknowledged something we sent
    Ack { command_id: Option<String> },

    /// Anything else, including text that is not JSON
    Unrecognized { kind: Option<String> },
}

/// Sort an inbound text frame into one of the known message kinds.
pub fn classify(text: &str) -> InboundMessage {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return InboundMessage::Unrecognized { kind: None };
    };

    let kind = value.get("type").and_then(Value::as_str);
    match kind {
        Some("heartbeat-ack" | "heartbeat_ack" | "heartbeatAck") => InboundMessage::HeartbeatAck,
        Some("command") => classify_command(value.get("command")),
        Some("ack") => InboundMessage::Ack {
            command_id: value
                .get("commandId")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        other => InboundMessage::Unrecognized {
            kind: other.map(str::to_string),
        },
    }
}

fn classify_command(command: Option<&Value>) -> InboundMessage {
    let Some(command) = command else {
        return InboundMessage::MalformedCommand {
            id: None,
            requires_ack: false,
            reason: "missing `command` object".to_string(),
        };
    };

    match serde_json::from_value::<CommandEnvelope>(command.clone()) {
        Ok(envelope) if envelope.id.trim().is_empty() => InboundMessage::MalformedCommand {
            id: None,
            requires_ack: envelope.requires_ack,
            reason: "command id is empty".to_string(),
        },
        Ok(envelope) => InboundMessage::Command(envelope),
        Err(e) => InboundMessage::MalformedCommand {
            id: command
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.trim().is_empty())
                .map(str::to_string),
            requires_ack: command
                .get("requiresAck")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            reason: e.to_string(),
        },
    }
}
