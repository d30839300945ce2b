//! Buffer store trait definition
//!
//! This module defines the `BufferStore` trait implemented by every
//! buffer backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::error::{StorageError, StorageResult};
use super::schema::{BufferStats, EnqueueOutcome, IngestRecord, NewRecord, PurgeOutcome};

/// Health status of the buffer backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// `now - age`, clamped to the earliest representable time
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Durable queue of ingest records shared by every gateway task
///
/// The buffer is the only shared mutable state in the gateway: the collector
/// writes to it, the forwarder drains it and the retention sweep purges it.
/// Implementations must therefore make every state transition atomic, so no
/// caller can observe a record halfway between two states.
///
/// ## Transitions
///
/// - `drain_batch`: pending → in-flight
/// - `mark_delivered`: in-flight → delivered
/// - `mark_failed`: in-flight → pending, `attempts + 1`
/// - `requeue_in_flight`: in-flight → pending (stale lease, attempts unchanged)
///
/// Transitions are compare-and-set: ids that are not in the expected source
/// state are skipped, and the returned count only includes records that moved.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared across tasks
/// behind an `Arc<dyn BufferStore>`.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Persist a single record and return its id (also when it was already
    /// buffered).
    async fn enqueue(&self, record: NewRecord) -> StorageResult<String> {
        let outcome = self.enqueue_batch(vec![record]).await?;
        outcome
            .inserted
            .into_iter()
            .chain(outcome.duplicates)
            .next()
            .ok_or_else(|| StorageError::QueryFailed("enqueue returned no id".to_string()))
    }

    /// Persist several records atomically, all or nothing.
    ///
    /// Records are validated first; the first invalid record fails the whole
    /// call with `StorageError::Validation`. A record whose id is already
    /// buffered is not written twice and is reported in `duplicates`.
    async fn enqueue_batch(&self, records: Vec<NewRecord>) -> StorageResult<EnqueueOutcome>;

    /// Select up to `max_size` of the oldest pending records and move them to
    /// in-flight in one atomic step.
    ///
    /// Two concurrent drains never return the same record.
    async fn drain_batch(&self, max_size: usize) -> StorageResult<Vec<IngestRecord>>;

    /// Move in-flight records to delivered. Returns how many moved.
    async fn mark_delivered(&self, ids: &[String]) -> StorageResult<u64>;

    /// Move in-flight records back to pending with `attempts + 1`.
    async fn mark_failed(&self, ids: &[String]) -> StorageResult<u64>;

    /// Remove every record enqueued more than `retention` ago, whatever its
    /// state, then delivered records whose delivery is older than
    /// `confirmation_grace`.
    async fn purge_older_than(
        &self,
        retention: Duration,
        confirmation_grace: Duration,
    ) -> StorageResult<PurgeOutcome>;

    /// Return in-flight records leased before `leased_before` to pending.
    async fn requeue_in_flight(&self, leased_before: DateTime<Utc>) -> StorageResult<u64>;

    /// Number of pending + in-flight records
    async fn depth(&self) -> StorageResult<u64>;

    async fn stats(&self) -> StorageResult<BufferStats>;

    /// Look up a record by id
    async fn get(&self, id: &str) -> StorageResult<Option<IngestRecord>>;

    /// Perform a lightweight check that the backend is usable.
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
