//! Record types held by the buffer store
//!
//! ## Lifecycle
//!
//! ```text
//! Collector ──enqueue──► pending ──drain──► in-flight ──mark_delivered──► delivered
//!                           ▲                   │
//!                           └────mark_failed────┘ (attempts + 1)
//! ```
//!
//! Every record has exactly one [`DeliveryState`]. Transitions are checked with
//! [`DeliveryState::can_transition_to`] so backends never move a record along an
//! edge that is not in the diagram above.
//!
//! ## Wire Format
//!
//! Agents submit records as loosely-typed JSON. [`NewRecord::from_wire`] turns one
//! JSON value into a validated record, so a single malformed record can be rejected
//! without failing the rest of its batch.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Longest record id we accept from agents
pub const MAX_ID_LEN: usize = 128;

/// Delivery state of a buffered record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryState {
    /// Waiting for the next forwarder cycle
    Pending,

    /// Selected by a drain, delivery outcome not yet known
    InFlight,

    /// Accepted by the uplink, kept until the confirmation grace period ends
    Delivered,
}

impl DeliveryState {
    /// Storage representation (matches the serde format)
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in-flight",
            DeliveryState::Delivered => "delivered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryState::Pending),
            "in-flight" => Some(DeliveryState::InFlight),
            "delivered" => Some(DeliveryState::Delivered),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        matches!(
            (self, next),
            (DeliveryState::Pending, DeliveryState::InFlight)
                | (DeliveryState::InFlight, DeliveryState::Delivered)
                | (DeliveryState::InFlight, DeliveryState::Pending)
        )
    }

    /// Counted by `depth()`
    pub fn is_undelivered(&self) -> bool {
        !matches!(self, DeliveryState::Delivered)
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record persisted in the buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRecord {
    /// Globally unique id (agent-provided or generated on ingest)
    pub id: String,

    #[serde(rename = "type")]
    pub record_type: String,

    pub occurred_at: DateTime<Utc>,

    /// Opaque structured data from the agent
    pub payload: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,

    /// Failed delivery attempts so far (never decreases)
    pub attempts: u32,

    /// When the gateway buffered the record; drives drain order and retention
    pub enqueued_at: DateTime<Utc>,

    /// `enqueuedAt` as reported by the agent, forwarded but never trusted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_enqueued_at: Option<DateTime<Utc>>,

    pub delivery_state: DeliveryState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// A validated record that has not been written yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub id: String,
    pub record_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
    pub source: Option<String>,
    pub channel: Option<String>,
    pub context: Option<Value>,
    pub organization_id: Option<String>,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub agent_enqueued_at: Option<DateTime<Utc>>,
}

/// Why a single ingest record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("record is missing `type`")]
    MissingType,

    #[error("record is missing `occurredAt`")]
    MissingOccurredAt,

    #[error("record is missing `payload`")]
    MissingPayload,

    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Loosely-typed record as sent by agents
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    id: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    occurred_at: Option<Value>,
    payload: Option<Value>,
    source: Option<String>,
    attempts: Option<u32>,
    enqueued_at: Option<Value>,
    channel: Option<String>,
    context: Option<Value>,
}

impl NewRecord {
    /// Build a record with a generated id, stamped with the current time
    pub fn new(record_type: impl Into<String>, occurred_at: DateTime<Utc>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            record_type: record_type.into(),
            occurred_at,
            payload,
            source: None,
            channel: None,
            context: None,
            organization_id: None,
            attempts: 0,
            enqueued_at: Utc::now(),
            agent_enqueued_at: None,
        }
    }

    /// Parse and validate one agent record.
    ///
    /// `organization_id` is the batch-level organization, passed explicitly by the
    /// caller. `now` is always the buffer's `enqueued_at`; an agent-supplied
    /// `enqueuedAt` is kept apart so it cannot move the record in the drain
    /// order or past the retention ceiling.
    pub fn from_wire(
        value: Value,
        organization_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let wire: WireRecord =
            serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let record_type = wire.record_type.ok_or(ValidationError::MissingType)?;
        let occurred_at = wire
            .occurred_at
            .as_ref()
            .ok_or(ValidationError::MissingOccurredAt)
            .and_then(|v| parse_timestamp(v, "occurredAt"))?;
        let payload = wire.payload.ok_or(ValidationError::MissingPayload)?;

        let agent_enqueued_at = match wire.enqueued_at.as_ref() {
            Some(Value::Null) | None => None,
            Some(v) => Some(parse_timestamp(v, "enqueuedAt")?),
        };

        let record = Self {
            id: wire.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            record_type,
            occurred_at,
            payload,
            source: wire.source,
            channel: wire.channel,
            context: wire.context.filter(|c| !c.is_null()),
            organization_id: organization_id.map(str::to_string),
            attempts: wire.attempts.unwrap_or(0),
            enqueued_at: now,
            agent_enqueued_at,
        };

        record.validate()?;
        Ok(record)
    }

    /// Check the fields every buffered record must carry.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.record_type.trim().is_empty() {
            return Err(ValidationError::MissingType);
        }
        if self.payload.is_null() {
            return Err(ValidationError::MissingPayload);
        }
        if self.id.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.id.len() > MAX_ID_LEN {
            return Err(ValidationError::InvalidField {
                field: "id",
                reason: format!("longer than {MAX_ID_LEN} characters"),
            });
        }
        Ok(())
    }

    /// The persisted form of this record, in its initial state
    pub fn into_pending(self) -> IngestRecord {
        IngestRecord {
            id: self.id,
            record_type: self.record_type,
            occurred_at: self.occurred_at,
            payload: self.payload,
            source: self.source,
            channel: self.channel,
            context: self.context,
            organization_id: self.organization_id,
            attempts: self.attempts,
            enqueued_at: self.enqueued_at,
            agent_enqueued_at: self.agent_enqueued_at,
            delivery_state: DeliveryState::Pending,
            delivered_at: None,
        }
    }
}

/// Accepts RFC 3339 strings and epoch milliseconds.
fn parse_timestamp(value: &Value, field: &'static str) -> Result<DateTime<Utc>, ValidationError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ValidationError::InvalidField {
                field,
                reason: e.to_string(),
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| ValidationError::InvalidField {
                field,
                reason: format!("{n} is not a valid epoch millisecond timestamp"),
            }),
        Value::Null => Err(match field {
            "occurredAt" => ValidationError::MissingOccurredAt,
            _ => ValidationError::InvalidField {
                field,
                reason: "must not be null".to_string(),
            },
        }),
        other => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected a timestamp, got {other}"),
        }),
    }
}

/// Result of an enqueue: which ids were written and which were already buffered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub inserted: Vec<String>,

    /// Ids already present in the buffer (or earlier in the same batch)
    pub duplicates: Vec<String>,
}

/// Counts by delivery state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub pending: u64,
    pub in_flight: u64,
    pub delivered: u64,

    /// Enqueue time of the oldest pending record
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl BufferStats {
    /// Pending + in-flight
    pub fn depth(&self) -> u64 {
        self.pending + self.in_flight
    }
}

/// Result of one purge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeOutcome {
    /// Removed because they passed the hard retention ceiling
    pub expired: u64,

    /// Delivered records removed after the confirmation grace period
    pub confirmed: u64,
}

impl PurgeOutcome {
    pub fn total(&self) -> u64 {
        self.expired + self.confirmed
    }
}
