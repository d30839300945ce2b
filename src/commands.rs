//! Control command dispatch
//!
//! Turns a [`CommandEnvelope`] received on the control channel into a gateway
//! action. Dispatch only validates the command and queues the work; the ack
//! sent back reflects acceptance, not completion.
//!
//! | type                     | payload                    | effect                         |
//! |--------------------------|----------------------------|--------------------------------|
//! | `flush`                  | none                       | immediate forwarder cycle      |
//! | `purge`                  | none                       | immediate retention sweep      |
//! | `ping`                   | none                       | nothing                        |
//! | `set_heartbeat_interval` | `{"intervalSecs": 1..3600}` | new heartbeat period           |

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::actors::forwarder::ForwarderHandle;
use crate::actors::retention::RetentionHandle;
use crate::protocol::CommandEnvelope;

pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 3600;

/// Why a command was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unsupported command type `{0}`")]
    Unsupported(String),

    #[error("invalid payload for `{command}`: {reason}")]
    InvalidPayload { command: String, reason: String },

    #[error("{target} unavailable: {reason}")]
    Unavailable {
        target: &'static str,
        reason: String,
    },
}

/// What the control channel itself has to do after a command was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    None,
    FlushRequested,
    SweepRequested,
    HeartbeatInterval(Duration),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatIntervalPayload {
    interval_secs: u64,
}

/// Routes commands to the actors that carry them out
#[derive(Clone)]
pub struct CommandDispatcher {
    forwarder: ForwarderHandle,
    retention: RetentionHandle,
}

impl CommandDispatcher {
    pub fn new(forwarder: ForwarderHandle, retention: RetentionHandle) -> Self {
        Self {
            forwarder,
            retention,
        }
    }

    pub fn dispatch(&self, envelope: &CommandEnvelope) -> Result<CommandEffect, CommandError> {
        debug!("dispatching command {} ({})", envelope.id, envelope.command_type);

        match envelope.command_type.as_str() {
            "flush" => {
                self.forwarder
                    .request_flush()
                    .map_err(|e| CommandError::Unavailable {
                        target: "forwarder",
                        reason: format!("{e:#}"),
                    })?;
                Ok(CommandEffect::FlushRequested)
            }
            "purge" => {
                self.retention
                    .request_run()
                    .map_err(|e| CommandError::Unavailable {
                        target: "retention",
                        reason: format!("{e:#}"),
                    })?;
                Ok(CommandEffect::SweepRequested)
            }
            "ping" => Ok(CommandEffect::None),
            "set_heartbeat_interval" => {
                let interval = parse_heartbeat_interval(envelope)?;
                Ok(CommandEffect::HeartbeatInterval(interval))
            }
            other => Err(CommandError::Unsupported(other.to_string())),
        }
    }
}

fn parse_heartbeat_interval(envelope: &CommandEnvelope) -> Result<Duration, CommandError> {
    let invalid = |reason: String| CommandError::InvalidPayload {
        command: envelope.command_type.clone(),
        reason,
    };

    let payload: HeartbeatIntervalPayload =
        serde_json::from_value(envelope.payload.clone()).map_err(|e| invalid(e.to_string()))?;

    if !(1..=MAX_HEARTBEAT_INTERVAL_SECS).contains(&payload.interval_secs) {
        return Err(invalid(format!(
            "intervalSecs must be between 1 and {MAX_HEARTBEAT_INTERVAL_SECS}"
        )));
    }

    Ok(Duration::from_secs(payload.interval_secs))
}
