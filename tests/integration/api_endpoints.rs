//! Integration tests for API endpoints
//!
//! These tests verify that:
//! - Ingest over HTTP buffers records and reports partial acceptance
//! - Health and stats endpoints reflect the buffer
//! - Storage failures map to 503
//! - The server stops on its shutdown signal

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edge_gateway::{
    api::{ApiState, spawn_api_server},
    buffer::{
        BufferStats, BufferStore, EnqueueOutcome, HealthStatus, IngestRecord, MemoryBuffer,
        NewRecord, PurgeOutcome, StorageError, StorageResult,
    },
    collector::Collector,
    health::HealthReporter,
};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::helpers::{GATEWAY_ID, health_config, spawn_forwarder, spawn_retention, wire_record};

async fn spawn_test_api(
    buffer: Arc<dyn BufferStore>,
) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let (forwarder, delivery) = spawn_forwarder(buffer.clone(), "http://127.0.0.1:9", 100);
    let retention = spawn_retention(buffer.clone());
    let health = HealthReporter::new(GATEWAY_ID, buffer.clone(), delivery, None, health_config());
    let collector = Collector::new(buffer.clone(), GATEWAY_ID, None, 5);

    let state = ApiState::new(GATEWAY_ID, collector, health, buffer, forwarder, retention, None);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (addr, task) = spawn_api_server("127.0.0.1:0".parse().unwrap(), state, async {
        let _ = stop_rx.await;
    })
    .await
    .unwrap();

    (addr, stop_tx, task)
}

#[tokio::test]
async fn test_ingest_health_and_stats() {
    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());
    let (addr, stop, task) = spawn_test_api(buffer.clone()).await;
    let client = reqwest::Client::new();

    let mut bad = wire_record("x");
    bad["occurredAt"] = json!("yesterday");
    let response = client
        .post(format!("http://{addr}/api/v1/ingest"))
        .json(&json!({
            "gatewayId": GATEWAY_ID,
            "records": [wire_record("a"), wire_record("b"), wire_record("c"), bad]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], 3);
    assert_eq!(body["rejected"], 1);
    assert_eq!(body["queueDepth"], 3);
    assert_eq!(body["errors"][0]["index"], 3);
    assert_eq!(buffer.depth().await.unwrap(), 3);

    let health: Value = client
        .get(format!("http://{addr}/api/v1/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["gatewayId"], GATEWAY_ID);
    assert_eq!(health["buffer"]["depth"], 3);

    let stats: Value = client
        .get(format!("http://{addr}/api/v1/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // the forwarder may hold a lease from its startup cycle
    let buffered = stats["buffer"]["pending"].as_u64().unwrap()
        + stats["buffer"]["inFlight"].as_u64().unwrap();
    assert_eq!(buffered, 3);
    assert!(stats["forwarder"].is_object());

    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_request_errors_are_400() {
    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());
    let (addr, _stop, _task) = spawn_test_api(buffer.clone()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/v1/ingest");

    let too_many: Vec<Value> = (0..6).map(|_| wire_record("a")).collect();
    let cases = [
        json!({"gatewayId": "", "records": [wire_record("a")]}),
        json!({"gatewayId": "other-gateway", "records": [wire_record("a")]}),
        json!({"gatewayId": GATEWAY_ID, "records": too_many}),
        json!({"gatewayId": GATEWAY_ID, "records": "not-a-list"}),
    ];

    for case in cases {
        let response = client.post(&url).json(&case).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "case {case}");
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].is_string());
    }

    assert_eq!(buffer.depth().await.unwrap(), 0);
}

/// Buffer whose writes and stats always fail
struct BrokenBuffer {
    inner: MemoryBuffer,
}

#[async_trait]
impl BufferStore for BrokenBuffer {
    async fn enqueue_batch(&self, _records: Vec<NewRecord>) -> StorageResult<EnqueueOutcome> {
        Err(StorageError::QueryFailed("disk full".to_string()))
    }

    async fn drain_batch(&self, max_size: usize) -> StorageResult<Vec<IngestRecord>> {
        self.inner.drain_batch(max_size).await
    }

    async fn mark_delivered(&self, ids: &[String]) -> StorageResult<u64> {
        self.inner.mark_delivered(ids).await
    }

    async fn mark_failed(&self, ids: &[String]) -> StorageResult<u64> {
        self.inner.mark_failed(ids).await
    }

    async fn purge_older_than(
        &self,
        retention: chrono::Duration,
        confirmation_grace: chrono::Duration,
    ) -> StorageResult<PurgeOutcome> {
        self.inner.purge_older_than(retention, confirmation_grace).await
    }

    async fn requeue_in_flight(&self, leased_before: DateTime<Utc>) -> StorageResult<u64> {
        self.inner.requeue_in_flight(leased_before).await
    }

    async fn depth(&self) -> StorageResult<u64> {
        self.inner.depth().await
    }

    async fn stats(&self) -> StorageResult<BufferStats> {
        Err(StorageError::QueryFailed("disk full".to_string()))
    }

    async fn get(&self, id: &str) -> StorageResult<Option<IngestRecord>> {
        self.inner.get(id).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.inner.health_check().await
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_storage_failure_is_503() {
    let buffer: Arc<dyn BufferStore> = Arc::new(BrokenBuffer {
        inner: MemoryBuffer::new(),
    });
    let (addr, _stop, _task) = spawn_test_api(buffer).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/api/v1/ingest"))
        .json(&json!({"gatewayId": GATEWAY_ID, "records": [wire_record("a")]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = client
        .get(format!("http://{addr}/api/v1/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // health still answers, degraded
    let health: Value = client
        .get(format!("http://{addr}/api/v1/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "degraded");
    assert!(health["buffer"]["error"].is_string());
}
