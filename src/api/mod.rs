//! HTTP API of the gateway
//!
//! ## Endpoints
//!
//! - `POST /api/v1/ingest` - Accept a batch of records from a local agent
//! - `GET /api/v1/health` - Gateway health snapshot
//! - `GET /api/v1/stats` - Buffer and actor statistics
//!
//! ## Architecture
//!
//! - **Axum** web framework with a Tower HTTP trace layer
//! - **Actor handles** and the buffer shared through [`ApiState`]

pub mod error;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::StatsResponse;

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the router with all routes
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/ingest", post(routes::ingest::ingest))
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/stats", get(routes::stats::get_stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the API server
///
/// Binds `bind_addr` and serves in a background task until `shutdown`
/// completes. Returns the bound address (useful with port 0) and the task.
pub async fn spawn_api_server<F>(
    bind_addr: SocketAddr,
    state: ApiState,
    shutdown: F,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("starting API server on {}", bind_addr);

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("API server error: {}", e);
        }
        info!("API server stopped");
    });

    Ok((addr, task))
}
