//! HTTP delivery of record batches to the central service
//!
//! The client is built once and reused for every forwarder cycle. Every
//! request carries the configured timeout, so a stalled uplink can never hold
//! up the next cycle. Any non-2xx answer fails the whole batch.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::buffer::IngestRecord;
use crate::config::UplinkConfig;

/// Longest response body kept in an error
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("uplink request timed out")]
    Timeout,

    #[error("uplink transport error: {0}")]
    Transport(String),

    #[error("uplink answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid uplink URL: {0}")]
    InvalidUrl(String),

    #[error("failed to build uplink client: {0}")]
    Client(String),
}

impl From<reqwest::Error> for UplinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UplinkError::Timeout
        } else {
            UplinkError::Transport(err.to_string())
        }
    }
}

/// One delivery attempt worth of records (never persisted)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestBatch {
    pub batch_id: String,
    pub gateway_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub records: Vec<IngestRecord>,
}

impl IngestBatch {
    pub fn new(
        gateway_id: impl Into<String>,
        organization_id: Option<String>,
        records: Vec<IngestRecord>,
    ) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            gateway_id: gateway_id.into(),
            organization_id,
            sent_at: Utc::now(),
            records,
        }
    }

    /// Split drained records into one batch per organization, in order of
    /// first appearance.
    ///
    /// Records without an organization go to `fallback_organization`.
    pub fn per_organization(
        gateway_id: &str,
        fallback_organization: Option<&str>,
        records: Vec<IngestRecord>,
    ) -> Vec<Self> {
        let mut batches: Vec<Self> = Vec::new();

        for record in records {
            let organization = record
                .organization_id
                .clone()
                .or_else(|| fallback_organization.map(str::to_string));

            match batches
                .iter_mut()
                .find(|batch| batch.organization_id == organization)
            {
                Some(batch) => batch.records.push(record),
                None => batches.push(Self::new(gateway_id, organization, vec![record])),
            }
        }

        batches
    }

    pub fn record_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Client for the central batch endpoint
#[derive(Debug, Clone)]
pub struct UplinkClient {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
    gateway_id: String,
}

impl UplinkClient {
    pub fn new(config: &UplinkConfig, gateway_id: impl Into<String>) -> Result<Self, UplinkError> {
        let endpoint = join_endpoint(&config.base_url, &config.path)?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("edge-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UplinkError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
            gateway_id: gateway_id.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Submit one batch. Only a 2xx answer counts as delivered.
    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id, records = batch.len()))]
    pub async fn deliver(&self, batch: &IngestBatch) -> Result<(), UplinkError> {
        trace!("posting batch to {}", self.endpoint);

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("X-Gateway-Id", &self.gateway_id)
            .json(batch);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(UplinkError::Status { status, body });
        }

        debug!("uplink accepted batch ({})", status);
        Ok(())
    }
}

/// `base` + `path`, keeping any path prefix already on `base`
fn join_endpoint(base: &Url, path: &str) -> Result<Url, UplinkError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| UplinkError::InvalidUrl(format!("{joined}: {e}")))
}
