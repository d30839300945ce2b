//! Record ingestion endpoint

use axum::{Json, extract::State, extract::rejection::JsonRejection};
use tracing::debug;

use crate::api::{error::ApiResult, state::ApiState};
use crate::collector::{IngestRequest, IngestResponse};

/// POST /api/v1/ingest
///
/// 200 with per-record results once the valid records are buffered, 400 for
/// an unusable request, 503 when the buffer cannot be written.
pub async fn ingest(
    State(state): State<ApiState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> ApiResult<Json<IngestResponse>> {
    let Json(request) = payload?;
    debug!(
        "ingest request from {} with {} records",
        request.gateway_id,
        request.records.len()
    );

    let response = state.collector.ingest(request).await?;
    Ok(Json(response))
}
