//! Helper functions for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use edge_gateway::{
    actors::{forwarder::ForwarderHandle, retention::RetentionHandle},
    backoff::BackoffPolicy,
    buffer::BufferStore,
    config::{ForwarderConfig, HealthConfig, RetentionConfig, UplinkConfig},
    health::LinkStatusStore,
    uplink::UplinkClient,
};
use serde_json::{Value, json};
use url::Url;

pub const GATEWAY_ID: &str = "gw-test";

pub const BATCH_PATH: &str = "/api/v1/gateway/batches";

pub fn uplink_config(base: &str) -> UplinkConfig {
    UplinkConfig {
        base_url: Url::parse(base).unwrap(),
        path: BATCH_PATH.to_string(),
        token: Some("uplink-token".to_string()),
        timeout: Duration::from_secs(2),
    }
}

/// Interval long enough that only the startup tick and explicit flushes run
pub fn forwarder_config(batch_size: usize) -> ForwarderConfig {
    ForwarderConfig {
        interval: Duration::from_secs(3600),
        batch_size,
        backoff: BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(300)),
    }
}

pub fn retention_config(retention_days: u64, grace_secs: u64) -> RetentionConfig {
    RetentionConfig {
        retention: Duration::from_secs(retention_days * 86_400),
        confirmation_grace: Duration::from_secs(grace_secs),
        interval: Duration::from_secs(3600),
        in_flight_lease: Duration::from_secs(600),
    }
}

pub fn health_config() -> HealthConfig {
    HealthConfig {
        max_depth: 1000,
        disconnect_threshold: Duration::from_secs(3600),
    }
}

pub fn spawn_forwarder(
    buffer: Arc<dyn BufferStore>,
    uplink_base: &str,
    batch_size: usize,
) -> (ForwarderHandle, LinkStatusStore) {
    let link = LinkStatusStore::connected();
    let client = UplinkClient::new(&uplink_config(uplink_base), GATEWAY_ID).unwrap();
    let handle = ForwarderHandle::spawn(
        buffer,
        client,
        Some("org-test".to_string()),
        forwarder_config(batch_size),
        link.clone(),
    );
    (handle, link)
}

pub fn spawn_retention(buffer: Arc<dyn BufferStore>) -> RetentionHandle {
    RetentionHandle::spawn(buffer, retention_config(7, 3600))
}

pub fn wire_record(record_type: &str) -> Value {
    json!({
        "type": record_type,
        "occurredAt": "2025-06-01T12:00:00Z",
        "payload": {"source": "sensor", "value": 21.5}
    })
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
