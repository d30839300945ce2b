//! Integration tests for the SQLite buffer across restarts
//!
//! These tests verify that:
//! - Records accepted by the collector survive a restart
//! - Records leased by a crashed forwarder come back as pending
//! - Delivery through the forwarder is persisted

use std::sync::Arc;

use chrono::Utc;
use edge_gateway::{
    buffer::{BufferStore, DeliveryState, SqliteBuffer},
    collector::Collector,
};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{GATEWAY_ID, spawn_forwarder, wire_record};

#[tokio::test]
async fn test_accepted_records_survive_restart() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("buffer.db");

    {
        let buffer: Arc<dyn BufferStore> = Arc::new(SqliteBuffer::new(&db_path).await.unwrap());
        let collector = Collector::new(buffer.clone(), GATEWAY_ID, Some("org-1".into()), 100);

        let mut record = wire_record("door");
        record["id"] = json!("door-1");
        record["channel"] = json!("zigbee");
        record["context"] = json!({"room": "hall"});

        let response = collector
            .ingest_batch(GATEWAY_ID, None, vec![record, wire_record("window")])
            .await
            .unwrap();
        assert_eq!(response.accepted, 2);
        buffer.close().await.unwrap();
    }

    let buffer = SqliteBuffer::new(&db_path).await.unwrap();
    assert_eq!(buffer.depth().await.unwrap(), 2);

    let record = buffer.get("door-1").await.unwrap().unwrap();
    assert_eq!(record.record_type, "door");
    assert_eq!(record.channel.as_deref(), Some("zigbee"));
    assert_eq!(record.context, Some(json!({"room": "hall"})));
    assert_eq!(record.organization_id.as_deref(), Some("org-1"));
    assert_eq!(record.delivery_state, DeliveryState::Pending);
}

#[tokio::test]
async fn test_leased_records_are_recovered_after_crash() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("buffer.db");

    {
        let buffer: Arc<dyn BufferStore> = Arc::new(SqliteBuffer::new(&db_path).await.unwrap());
        let collector = Collector::new(buffer.clone(), GATEWAY_ID, None, 100);
        collector
            .ingest_batch(GATEWAY_ID, None, vec![wire_record("a"), wire_record("b")])
            .await
            .unwrap();

        // drained but never confirmed nor failed
        assert_eq!(buffer.drain_batch(10).await.unwrap().len(), 2);
        buffer.close().await.unwrap();
    }

    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let buffer: Arc<dyn BufferStore> = Arc::new(SqliteBuffer::new(&db_path).await.unwrap());
    assert_eq!(buffer.stats().await.unwrap().in_flight, 2);
    assert_eq!(buffer.requeue_in_flight(Utc::now()).await.unwrap(), 2);

    let (forwarder, _) = spawn_forwarder(buffer.clone(), &mock_server.uri(), 10);
    forwarder.flush().await.unwrap();

    let stats = buffer.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.delivered, 2);

    forwarder.shutdown().await;
}
