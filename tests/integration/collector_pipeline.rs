//! Integration tests for the ingest → buffer → uplink → retention pipeline
//!
//! These tests verify that:
//! - Accepted records are buffered before the collector answers
//! - The forwarder delivers them upstream and marks them delivered
//! - Retention removes confirmed records after the grace period

use std::sync::Arc;

use edge_gateway::{
    actors::retention::RetentionHandle,
    buffer::{BufferStore, DeliveryState, MemoryBuffer},
    collector::Collector,
};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{
    BATCH_PATH, GATEWAY_ID, retention_config, spawn_forwarder, wire_record,
};

#[tokio::test]
async fn test_ingest_forward_and_purge_round_trip() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .and(header("authorization", "Bearer uplink-token"))
        .and(header("x-gateway-id", GATEWAY_ID))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());
    let collector = Collector::new(buffer.clone(), GATEWAY_ID, None, 100);

    let mut invalid = wire_record("x");
    invalid.as_object_mut().unwrap().remove("type");
    let records = vec![wire_record("a"), wire_record("b"), invalid, wire_record("c")];

    let response = collector
        .ingest_batch(GATEWAY_ID, Some("org-test"), records)
        .await
        .unwrap();
    assert_eq!(response.accepted, 3);
    assert_eq!(response.rejected, 1);
    assert_eq!(buffer.depth().await.unwrap(), 3);

    let (forwarder, link) = spawn_forwarder(buffer.clone(), &mock_server.uri(), 100);
    let outcome = forwarder.flush().await.unwrap();

    // the startup tick may already have delivered the batch
    let stats = forwarder.get_stats().await.unwrap();
    assert_eq!(stats.delivered_records, 3);
    assert!(outcome.delivered == 3 || outcome.delivered == 0);
    assert_eq!(buffer.depth().await.unwrap(), 0);
    assert_eq!(buffer.stats().await.unwrap().delivered, 3);
    assert!(link.is_connected().await);

    let requests = mock_server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["gatewayId"], GATEWAY_ID);
    assert_eq!(body["organizationId"], "org-test");
    assert_eq!(body["records"].as_array().unwrap().len(), 3);

    let retention = RetentionHandle::spawn(buffer.clone(), retention_config(7, 0));
    let report = retention.run_now().await.unwrap();
    let total = retention.get_stats().await.unwrap().total_confirmed;
    assert!(report.confirmed == 3 || total == 3);
    assert_eq!(buffer.stats().await.unwrap().delivered, 0);

    forwarder.shutdown().await;
    retention.shutdown().await;
}

#[tokio::test]
async fn test_backlog_is_drained_in_several_batches() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(ResponseTemplate::new(202))
        .expect(3)
        .mount(&mock_server)
        .await;

    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());
    let collector = Collector::new(buffer.clone(), GATEWAY_ID, None, 100);

    let records = (0..25)
        .map(|i| json!({"id": format!("r-{i}"), "type": "t", "occurredAt": 1717243200000u64, "payload": i}))
        .collect();
    collector.ingest_batch(GATEWAY_ID, None, records).await.unwrap();

    // batches of 10: 10 + 10 + 5 in one cycle
    let (forwarder, _) = spawn_forwarder(buffer.clone(), &mock_server.uri(), 10);
    forwarder.flush().await.unwrap();

    let stats = forwarder.get_stats().await.unwrap();
    assert_eq!(stats.batches_sent, 3);
    assert_eq!(stats.delivered_records, 25);

    let record = buffer.get("r-24").await.unwrap().unwrap();
    assert_eq!(record.delivery_state, DeliveryState::Delivered);

    forwarder.shutdown().await;
}
