//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to one actor via mpsc
//! 2. **Responses**: Returned over a oneshot channel owned by the caller
//! 3. **Stats**: Plain cloneable snapshots, serializable for the stats endpoint
//!
//! Actors never share state with each other. The buffer store is the only
//! resource they have in common.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::buffer::StorageError;

use super::forwarder::ForwardError;

/// Commands that can be sent to the ForwarderActor
#[derive(Debug)]
pub enum ForwarderCommand {
    /// Run a delivery cycle now, ignoring any pending backoff
    ///
    /// `respond_to` is `None` for fire-and-forget requests (control commands).
    FlushNow {
        respond_to: Option<oneshot::Sender<Result<FlushOutcome, ForwardError>>>,
    },

    GetStats {
        respond_to: oneshot::Sender<ForwarderStats>,
    },

    /// Stop after the current cycle; `respond_to` fires once the loop has exited
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Where the forwarder is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwarderState {
    Idle,
    Draining,
    Sending,

    /// Waiting out a delay after a failed delivery
    Backoff,
}

/// Result of one forwarder cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushOutcome {
    /// Batches accepted by the uplink
    pub batches: u64,

    /// Records marked delivered
    pub delivered: u64,
}

/// Forwarder statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwarderStats {
    pub state: ForwarderState,
    pub cycles: u64,
    pub batches_sent: u64,
    pub delivered_records: u64,
    pub failed_batches: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    /// When the next attempt is allowed while in backoff
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Default for ForwarderStats {
    fn default() -> Self {
        Self {
            state: ForwarderState::Idle,
            cycles: 0,
            batches_sent: 0,
            delivered_records: 0,
            failed_batches: 0,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            next_attempt_at: None,
        }
    }
}

/// Commands that can be sent to the RetentionActor
#[derive(Debug)]
pub enum RetentionCommand {
    /// Run a sweep now
    RunNow {
        respond_to: Option<oneshot::Sender<Result<SweepReport, StorageError>>>,
    },

    GetStats {
        respond_to: oneshot::Sender<RetentionStats>,
    },

    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Result of one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Removed past the hard retention ceiling
    pub expired: u64,

    /// Delivered records removed after the grace period
    pub confirmed: u64,

    /// Stale in-flight records returned to pending
    pub requeued: u64,
}

/// Retention statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionStats {
    pub sweeps: u64,
    pub failed_sweeps: u64,
    pub last_sweep: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_expired: u64,
    pub total_confirmed: u64,
    pub total_requeued: u64,
}

/// Commands that can be sent to the ControlChannelActor
#[derive(Debug)]
pub enum ControlCommand {
    GetState {
        respond_to: oneshot::Sender<ControlStats>,
    },

    /// Close the socket and stop reconnecting
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Connection state of the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Control channel statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStats {
    pub state: ControlState,
    pub connections: u64,
    pub heartbeats_sent: u64,
    pub commands_received: u64,
    pub acks_sent: u64,
    pub heartbeat_interval_secs: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ControlStats {
    pub fn new(heartbeat_interval_secs: u64) -> Self {
        Self {
            state: ControlState::Disconnected,
            connections: 0,
            heartbeats_sent: 0,
            commands_received: 0,
            acks_sent: 0,
            heartbeat_interval_secs,
            last_connected: None,
            last_error: None,
        }
    }
}
