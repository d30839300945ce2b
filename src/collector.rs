//! Collector - Accepts record batches from local agents
//!
//! Every record is validated on its own, so one bad record never costs the
//! rest of the batch. Valid records are written to the buffer in a single
//! transaction before the response is built: an accepted record is durable
//! even if the uplink is down. The collector never talks to the uplink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::buffer::{BufferStore, EnqueueOutcome, NewRecord, StorageError};

/// How many rejection reasons are repeated in the response message
const MESSAGE_REASONS: usize = 3;

#[derive(Debug, Error)]
pub enum CollectorError {
    /// The request as a whole is unacceptable; nothing was stored
    #[error("{0}")]
    InvalidRequest(String),

    /// The valid records could not be stored; nothing was accepted
    #[error("failed to buffer records: {0}")]
    Storage(#[from] StorageError),
}

/// Body of an ingest request
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub gateway_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,

    /// Kept as raw JSON so each record is decoded and judged on its own
    #[serde(default)]
    pub records: Vec<Value>,
}

/// One record that was turned away
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRejection {
    /// Position of the record in the request
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Records newly written to the buffer
    pub accepted: u64,
    pub rejected: u64,

    /// Valid records whose id was already buffered (resends); not counted
    /// as accepted, still durable
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duplicates: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RecordRejection>,
}

/// Validates ingest batches and writes them to the buffer
#[derive(Clone)]
pub struct Collector {
    buffer: Arc<dyn BufferStore>,
    gateway_id: String,
    default_organization: Option<String>,
    max_records: usize,
}

impl Collector {
    pub fn new(
        buffer: Arc<dyn BufferStore>,
        gateway_id: impl Into<String>,
        default_organization: Option<String>,
        max_records: usize,
    ) -> Self {
        Self {
            buffer,
            gateway_id: gateway_id.into(),
            default_organization,
            max_records,
        }
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse, CollectorError> {
        self.ingest_batch(
            &request.gateway_id,
            request.organization_id.as_deref(),
            request.records,
        )
        .await
    }

    /// Validate and buffer a batch.
    ///
    /// `organization_id` falls back to the gateway's own organization when
    /// absent or empty.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn ingest_batch(
        &self,
        gateway_id: &str,
        organization_id: Option<&str>,
        records: Vec<Value>,
    ) -> Result<IngestResponse, CollectorError> {
        let gateway_id = gateway_id.trim();
        if gateway_id.is_empty() {
            return Err(CollectorError::InvalidRequest(
                "gatewayId is required".to_string(),
            ));
        }
        if gateway_id != self.gateway_id {
            return Err(CollectorError::InvalidRequest(format!(
                "gatewayId `{gateway_id}` does not match this gateway"
            )));
        }
        if records.len() > self.max_records {
            return Err(CollectorError::InvalidRequest(format!(
                "too many records: {} (limit {})",
                records.len(),
                self.max_records
            )));
        }

        let organization = organization_id
            .map(str::trim)
            .filter(|org| !org.is_empty())
            .or(self.default_organization.as_deref());

        let now = Utc::now();
        let total = records.len();
        let mut valid = Vec::with_capacity(total);
        let mut errors = Vec::new();

        for (index, value) in records.into_iter().enumerate() {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);

            match NewRecord::from_wire(value, organization, now) {
                Ok(record) => valid.push(record),
                Err(e) => {
                    debug!("rejected record {}: {}", index, e);
                    errors.push(RecordRejection {
                        index,
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let outcome = if valid.is_empty() {
            EnqueueOutcome::default()
        } else {
            self.buffer.enqueue_batch(valid).await?
        };
        if !outcome.duplicates.is_empty() {
            debug!("{} records were already buffered", outcome.duplicates.len());
        }

        let queue_depth = match self.buffer.depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!("could not read buffer depth after ingest: {}", e);
                None
            }
        };

        if !errors.is_empty() {
            warn!("rejected {} of {} records", errors.len(), total);
        }

        Ok(IngestResponse {
            accepted: outcome.inserted.len() as u64,
            rejected: errors.len() as u64,
            duplicates: outcome.duplicates.len() as u64,
            message: rejection_message(&errors, total),
            queue_depth,
            processed_at: Utc::now(),
            errors,
        })
    }
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn rejection_message(errors: &[RecordRejection], total: usize) -> Option<String> {
    if errors.is_empty() {
        return None;
    }

    let reasons = errors
        .iter()
        .take(MESSAGE_REASONS)
        .map(|r| format!("#{}: {}", r.index, r.error))
        .collect::<Vec<_>>()
        .join("; ");

    Some(format!(
        "rejected {} of {} records ({})",
        errors.len(),
        total,
        reasons
    ))
}
