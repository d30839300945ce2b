//! In-memory buffer backend (no persistence)
//!
//! Useful for tests and for deployments that accept losing buffered records
//! on restart. All transitions happen under a single mutex, which gives the
//! same atomicity guarantees as the SQLite backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::backend::{BufferStore, HealthStatus, cutoff};
use super::error::StorageResult;
use super::schema::{
    BufferStats, DeliveryState, EnqueueOutcome, IngestRecord, NewRecord, PurgeOutcome,
};

struct Entry {
    record: IngestRecord,
    leased_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MemoryState {
    /// Records keyed by insertion sequence
    records: BTreeMap<u64, Entry>,

    /// id -> sequence
    index: HashMap<String, u64>,

    next_seq: u64,
}

impl MemoryState {
    /// Apply `transition` to every listed id currently in `from`.
    fn transition(
        &mut self,
        ids: &[String],
        from: DeliveryState,
        mut transition: impl FnMut(&mut Entry),
    ) -> u64 {
        let mut moved = 0;
        for id in ids {
            let Some(seq) = self.index.get(id) else {
                continue;
            };
            if let Some(entry) = self.records.get_mut(seq)
                && entry.record.delivery_state == from
            {
                transition(entry);
                moved += 1;
            }
        }
        moved
    }

    fn remove_where(&mut self, mut predicate: impl FnMut(&Entry) -> bool) -> u64 {
        let doomed: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &doomed {
            if let Some(entry) = self.records.remove(seq) {
                self.index.remove(&entry.record.id);
            }
        }
        doomed.len() as u64
    }
}

/// In-memory buffer backend
#[derive(Default)]
pub struct MemoryBuffer {
    state: Mutex<MemoryState>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BufferStore for MemoryBuffer {
    async fn enqueue_batch(&self, records: Vec<NewRecord>) -> StorageResult<EnqueueOutcome> {
        for record in &records {
            record.validate()?;
        }

        let mut state = self.state.lock().await;
        let mut outcome = EnqueueOutcome::default();

        for record in records {
            if state.index.contains_key(&record.id) {
                trace!("record {} already buffered, skipping", record.id);
                outcome.duplicates.push(record.id);
                continue;
            }

            outcome.inserted.push(record.id.clone());

            let seq = state.next_seq;
            state.next_seq += 1;
            state.index.insert(record.id.clone(), seq);
            state.records.insert(
                seq,
                Entry {
                    record: record.into_pending(),
                    leased_at: None,
                },
            );
        }

        Ok(outcome)
    }

    async fn drain_batch(&self, max_size: usize) -> StorageResult<Vec<IngestRecord>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;

        let mut candidates: Vec<(DateTime<Utc>, u64)> = state
            .records
            .iter()
            .filter(|(_, entry)| entry.record.delivery_state == DeliveryState::Pending)
            .map(|(seq, entry)| (entry.record.enqueued_at, *seq))
            .collect();
        candidates.sort_unstable();
        candidates.truncate(max_size);

        let now = Utc::now();
        let mut drained = Vec::with_capacity(candidates.len());
        for (_, seq) in candidates {
            if let Some(entry) = state.records.get_mut(&seq) {
                entry.record.delivery_state = DeliveryState::InFlight;
                entry.leased_at = Some(now);
                drained.push(entry.record.clone());
            }
        }

        debug!("drained {} records", drained.len());
        Ok(drained)
    }

    async fn mark_delivered(&self, ids: &[String]) -> StorageResult<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        Ok(state.transition(ids, DeliveryState::InFlight, |entry| {
            entry.record.delivery_state = DeliveryState::Delivered;
            entry.record.delivered_at = Some(now);
            entry.leased_at = None;
        }))
    }

    async fn mark_failed(&self, ids: &[String]) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        Ok(state.transition(ids, DeliveryState::InFlight, |entry| {
            entry.record.delivery_state = DeliveryState::Pending;
            entry.record.attempts = entry.record.attempts.saturating_add(1);
            entry.leased_at = None;
        }))
    }

    async fn purge_older_than(
        &self,
        retention: Duration,
        confirmation_grace: Duration,
    ) -> StorageResult<PurgeOutcome> {
        let now = Utc::now();
        let retention_cutoff = cutoff(now, retention);
        let delivered_cutoff = cutoff(now, confirmation_grace);

        let mut state = self.state.lock().await;

        let expired = state.remove_where(|entry| entry.record.enqueued_at < retention_cutoff);
        let confirmed = state.remove_where(|entry| {
            entry.record.delivery_state == DeliveryState::Delivered
                && entry
                    .record
                    .delivered_at
                    .is_some_and(|at| at <= delivered_cutoff)
        });

        Ok(PurgeOutcome { expired, confirmed })
    }

    async fn requeue_in_flight(&self, leased_before: DateTime<Utc>) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        let mut moved = 0;
        for entry in state.records.values_mut() {
            if entry.record.delivery_state == DeliveryState::InFlight
                && entry.leased_at.is_none_or(|at| at <= leased_before)
            {
                entry.record.delivery_state = DeliveryState::Pending;
                entry.leased_at = None;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn depth(&self) -> StorageResult<u64> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|entry| entry.record.delivery_state.is_undelivered())
            .count() as u64)
    }

    async fn stats(&self) -> StorageResult<BufferStats> {
        let state = self.state.lock().await;
        let mut stats = BufferStats::default();

        for entry in state.records.values() {
            match entry.record.delivery_state {
                DeliveryState::Pending => {
                    stats.pending += 1;
                    let enqueued = entry.record.enqueued_at;
                    if stats.oldest_pending.is_none_or(|oldest| enqueued < oldest) {
                        stats.oldest_pending = Some(enqueued);
                    }
                }
                DeliveryState::InFlight => stats.in_flight += 1,
                DeliveryState::Delivered => stats.delivered += 1,
            }
        }

        Ok(stats)
    }

    async fn get(&self, id: &str) -> StorageResult<Option<IngestRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .index
            .get(id)
            .and_then(|seq| state.records.get(seq))
            .map(|entry| entry.record.clone()))
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let mut metadata = HashMap::new();
        metadata.insert("backend".to_string(), "memory".to_string());

        Ok(HealthStatus {
            healthy: true,
            message: "in-memory buffer operational".to_string(),
            metadata,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
