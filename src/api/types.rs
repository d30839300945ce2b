//! API response types not owned by another module

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actors::messages::{ControlStats, ForwarderStats, RetentionStats};
use crate::buffer::BufferStats;

/// Response of `GET /api/v1/stats`
///
/// Actor sections are `None` when the actor did not answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
    pub buffer: BufferStats,
    pub forwarder: Option<ForwarderStats>,
    pub retention: Option<RetentionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlStats>,
}
