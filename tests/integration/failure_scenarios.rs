//! Integration tests for failure handling
//!
//! These tests verify that:
//! - A failed delivery returns the whole batch to pending with attempts + 1
//! - The health snapshot reflects a failing uplink
//! - Records are delivered once the uplink recovers
//! - Retention removes expired records even if they were never delivered

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use edge_gateway::{
    actors::{messages::ForwarderState, retention::RetentionHandle},
    buffer::{BufferStore, DeliveryState, MemoryBuffer, NewRecord},
    config::HealthConfig,
    health::{GatewayStatus, HealthReporter},
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{BATCH_PATH, GATEWAY_ID, retention_config, spawn_forwarder};

async fn enqueue(buffer: &Arc<dyn BufferStore>, id: &str) {
    let mut record = NewRecord::new("reading", Utc::now(), json!({"v": 1}));
    record.id = id.to_string();
    buffer.enqueue(record).await.unwrap();
}

#[tokio::test]
async fn test_uplink_failure_returns_batch_to_pending() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());
    enqueue(&buffer, "r-1").await;
    enqueue(&buffer, "r-2").await;

    let (forwarder, link) = spawn_forwarder(buffer.clone(), &mock_server.uri(), 10);

    // the startup cycle fails and enters backoff
    let stats = forwarder.get_stats().await.unwrap();
    assert_eq!(stats.state, ForwarderState::Backoff);
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.consecutive_failures, 1);
    assert!(stats.next_attempt_at.is_some());

    assert_eq!(buffer.depth().await.unwrap(), 2);
    for id in ["r-1", "r-2"] {
        let record = buffer.get(id).await.unwrap().unwrap();
        assert_eq!(record.delivery_state, DeliveryState::Pending);
        assert_eq!(record.attempts, 1);
    }

    assert!(!link.is_connected().await);
    let health = HealthReporter::new(
        GATEWAY_ID,
        buffer.clone(),
        link.clone(),
        None,
        HealthConfig {
            max_depth: 1000,
            disconnect_threshold: Duration::ZERO,
        },
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = health.snapshot().await;
    assert_eq!(snapshot.status, GatewayStatus::Degraded);
    assert!(!snapshot.uplink.connected);
    assert!(snapshot.uplink.last_error.is_some());

    forwarder.shutdown().await;
}

#[tokio::test]
async fn test_recovered_uplink_delivers_retried_records() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());
    enqueue(&buffer, "r-1").await;

    let (forwarder, link) = spawn_forwarder(buffer.clone(), &mock_server.uri(), 10);
    assert_eq!(
        forwarder.get_stats().await.unwrap().state,
        ForwarderState::Backoff
    );

    // an explicit flush ignores the pending backoff
    let outcome = forwarder.flush().await.unwrap();
    assert_eq!(outcome.delivered, 1);

    let record = buffer.get("r-1").await.unwrap().unwrap();
    assert_eq!(record.delivery_state, DeliveryState::Delivered);
    assert_eq!(record.attempts, 1);
    assert!(link.is_connected().await);

    let stats = forwarder.get_stats().await.unwrap();
    assert_eq!(stats.state, ForwarderState::Idle);
    assert_eq!(stats.consecutive_failures, 0);

    forwarder.shutdown().await;
}

#[tokio::test]
async fn test_retention_expires_undelivered_records() {
    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());

    let mut old = NewRecord::new("reading", Utc::now(), json!(1));
    old.id = "old".to_string();
    old.enqueued_at = Utc::now() - chrono::Duration::days(2);
    buffer.enqueue(old).await.unwrap();
    enqueue(&buffer, "fresh").await;

    let retention = RetentionHandle::spawn(buffer.clone(), retention_config(1, 3600));
    let stats = retention.get_stats().await.unwrap();

    assert_eq!(stats.total_expired, 1);
    assert!(buffer.get("old").await.unwrap().is_none());
    assert!(buffer.get("fresh").await.unwrap().is_some());

    retention.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_during_backoff_is_prompt() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());
    enqueue(&buffer, "r-1").await;

    let (forwarder, _) = spawn_forwarder(buffer, &mock_server.uri(), 10);
    assert_eq!(
        forwarder.get_stats().await.unwrap().state,
        ForwarderState::Backoff
    );

    let started = std::time::Instant::now();
    forwarder.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(forwarder.get_stats().await.is_none());
}
