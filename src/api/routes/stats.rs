//! Gateway statistics endpoint

use axum::{Json, extract::State};
use chrono::Utc;

use crate::api::{error::ApiResult, state::ApiState, types::StatsResponse};

/// GET /api/v1/stats
///
/// Buffer counts plus the statistics of every actor
pub async fn get_stats(State(state): State<ApiState>) -> ApiResult<Json<StatsResponse>> {
    let buffer = state.buffer.stats().await?;

    let (forwarder, retention) =
        tokio::join!(state.forwarder.get_stats(), state.retention.get_stats());

    let control = match &state.control {
        Some(handle) => handle.get_state().await,
        None => None,
    };

    Ok(Json(StatsResponse {
        gateway_id: state.gateway_id.clone(),
        timestamp: Utc::now(),
        buffer,
        forwarder,
        retention,
        control,
    }))
}
