//! Health check endpoint

use axum::{Json, extract::State};

use crate::api::state::ApiState;
use crate::health::GatewayHealthSnapshot;

/// GET /api/v1/health
///
/// Always answers 200; `status` says whether the gateway is degraded.
pub async fn health_check(State(state): State<ApiState>) -> Json<GatewayHealthSnapshot> {
    Json(state.health.snapshot().await)
}
