use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use edge_gateway::{
    actors::{control::ControlHandle, forwarder::ForwarderHandle, retention::RetentionHandle},
    api::{ApiState, spawn_api_server},
    buffer::{BufferStore, SqliteBuffer},
    collector::Collector,
    commands::CommandDispatcher,
    config::{ConfigError, GatewayConfig},
    health::{HealthReporter, LinkStatusStore},
    uplink::UplinkClient,
};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

fn init(level: LevelFilter) {
    let filter = filter::Targets::new()
        .with_targets(vec![
            ("edge_gateway", level),
            ("tower_http", LevelFilter::DEBUG),
        ])
        .with_default(LevelFilter::WARN);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(ConfigError::Cli(e)) => e.exit(),
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    init(LevelFilter::from_level(config.log_level.into()));
    trace!(
        "uplink {}, control {}",
        config.uplink.base_url,
        config.control.as_ref().map_or("disabled", |c| c.url.as_str())
    );
    info!(
        "starting edge gateway {} (v{})",
        config.gateway_id,
        env!("CARGO_PKG_VERSION")
    );

    let buffer: Arc<dyn BufferStore> = Arc::new(
        SqliteBuffer::new(&config.buffer_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open buffer at {}",
                    config.buffer_path.display()
                )
            })?,
    );

    // records leased by a previous process will never be confirmed
    let requeued = buffer
        .requeue_in_flight(Utc::now())
        .await
        .context("failed to recover in-flight records")?;
    if requeued > 0 {
        warn!("returned {} in-flight records from a previous run to pending", requeued);
    }

    let client = UplinkClient::new(&config.uplink, config.gateway_id.clone())
        .context("failed to build uplink client")?;
    let delivery = LinkStatusStore::connected();

    let retention = RetentionHandle::spawn(buffer.clone(), config.retention.clone());
    let forwarder = ForwarderHandle::spawn(
        buffer.clone(),
        client,
        config.organization_id.clone(),
        config.forwarder.clone(),
        delivery.clone(),
    );

    let (control, control_link) = match &config.control {
        Some(control_config) => {
            let link = LinkStatusStore::disconnected();
            let handle = ControlHandle::spawn(
                control_config.clone(),
                config.gateway_id.clone(),
                config.organization_id.clone(),
                buffer.clone(),
                CommandDispatcher::new(forwarder.clone(), retention.clone()),
                forwarder.clone(),
                link.clone(),
            );
            (Some(handle), Some(link))
        }
        None => {
            info!("no control URL configured, control channel disabled");
            (None, None)
        }
    };

    let health = HealthReporter::new(
        config.gateway_id.clone(),
        buffer.clone(),
        delivery,
        control_link,
        config.health.clone(),
    );
    let collector = Collector::new(
        buffer.clone(),
        config.gateway_id.clone(),
        config.organization_id.clone(),
        config.max_ingest_records,
    );

    let state = ApiState::new(
        config.gateway_id.clone(),
        collector,
        health,
        buffer.clone(),
        forwarder.clone(),
        retention.clone(),
        control.clone(),
    );

    let (addr, server) = spawn_api_server(config.bind_addr, state, shutdown_signal())
        .await
        .with_context(|| format!("failed to bind API on {}", config.bind_addr))?;
    info!("gateway ready, API listening on {}", addr);

    if let Err(e) = server.await {
        error!("API server task failed: {}", e);
    }

    info!("shutting down");
    if let Some(control) = &control {
        control.shutdown().await;
    }
    forwarder.shutdown().await;
    retention.shutdown().await;

    if let Err(e) = buffer.close().await {
        error!("failed to close buffer: {}", e);
    }

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
