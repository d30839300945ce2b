//! SQLite buffer backend
//!
//! Records live in a single `ingest_records` table in a local database file,
//! so buffered data survives gateway restarts and uplink outages.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (health, stats) never block the forwarder's drains
//! - **Atomic drains**: Selection and the pending → in-flight move happen in one
//!   `UPDATE ... RETURNING` statement
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds, payload and context as JSON text.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{BufferStore, HealthStatus, cutoff};
use super::error::{StorageError, StorageResult};
use super::schema::{
    BufferStats, DeliveryState, EnqueueOutcome, IngestRecord, NewRecord, PurgeOutcome,
};

/// Upper bound on bound parameters per `IN (...)` update
const MAX_IDS_PER_STATEMENT: usize = 500;

const RECORD_COLUMNS: &str = "seq, id, record_type, occurred_at, payload, source, channel, \
     context, organization_id, attempts, enqueued_at, agent_enqueued_at, delivery_state, \
     delivered_at";

/// SQLite buffer backend
pub struct SqliteBuffer {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBuffer {
    /// Open (or create) the buffer database at `db_path` and run migrations.
    ///
    /// ```no_run
    /// # use edge_gateway::buffer::SqliteBuffer;
    /// # async fn example() -> anyhow::Result<()> {
    /// let buffer = SqliteBuffer::new("./gateway-buffer.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("opening SQLite buffer at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running buffer migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("SQLite buffer ready");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn record_from_row(row: &SqliteRow) -> StorageResult<(i64, IngestRecord)> {
        let id: String = row.try_get("id")?;

        let corrupt = |reason: String| StorageError::CorruptRecord {
            id: id.clone(),
            reason,
        };

        let state_str: String = row.try_get("delivery_state")?;
        let delivery_state = DeliveryState::parse(&state_str)
            .ok_or_else(|| corrupt(format!("unknown delivery state `{state_str}`")))?;

        let payload_str: String = row.try_get("payload")?;
        let payload = serde_json::from_str(&payload_str)
            .map_err(|e| corrupt(format!("payload is not valid JSON: {e}")))?;

        let context = row
            .try_get::<Option<String>, _>("context")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| corrupt(format!("context is not valid JSON: {e}")))?;

        let attempts: i64 = row.try_get("attempts")?;

        let record = IngestRecord {
            id: id.clone(),
            record_type: row.try_get("record_type")?,
            occurred_at: Self::millis_to_timestamp(row.try_get("occurred_at")?),
            payload,
            source: row.try_get("source")?,
            channel: row.try_get("channel")?,
            context,
            organization_id: row.try_get("organization_id")?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            enqueued_at: Self::millis_to_timestamp(row.try_get("enqueued_at")?),
            agent_enqueued_at: row
                .try_get::<Option<i64>, _>("agent_enqueued_at")?
                .map(Self::millis_to_timestamp),
            delivery_state,
            delivered_at: row
                .try_get::<Option<i64>, _>("delivered_at")?
                .map(Self::millis_to_timestamp),
        };

        Ok((row.try_get("seq")?, record))
    }

    /// Compare-and-set update of `ids` that are currently in-flight.
    ///
    /// `set_clause` is a fixed SQL fragment; ids are always bound.
    async fn update_in_flight(&self, ids: &[String], set_clause: &str) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut moved = 0;

        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE ingest_records SET ");
            builder.push(set_clause);
            builder.push(" WHERE delivery_state = 'in-flight' AND id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");

            moved += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(moved)
    }
}

#[async_trait]
impl BufferStore for SqliteBuffer {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn enqueue_batch(&self, records: Vec<NewRecord>) -> StorageResult<EnqueueOutcome> {
        let mut outcome = EnqueueOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }
        for record in &records {
            record.validate()?;
        }

        let mut tx = self.pool.begin().await?;

        for record in records {
            let payload = serde_json::to_string(&record.payload)?;
            let context = record
                .context
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let result = sqlx::query(
                r#"
                INSERT INTO ingest_records (
                    id, record_type, occurred_at, payload, source, channel,
                    context, organization_id, attempts, enqueued_at, agent_enqueued_at,
                    delivery_state
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&record.id)
            .bind(&record.record_type)
            .bind(record.occurred_at.timestamp_millis())
            .bind(payload)
            .bind(&record.source)
            .bind(&record.channel)
            .bind(context)
            .bind(&record.organization_id)
            .bind(i64::from(record.attempts))
            .bind(record.enqueued_at.timestamp_millis())
            .bind(record.agent_enqueued_at.map(|t| t.timestamp_millis()))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                debug!("record {} already buffered, skipping", record.id);
                outcome.duplicates.push(record.id);
            } else {
                outcome.inserted.push(record.id);
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn drain_batch(&self, max_size: usize) -> StorageResult<Vec<IngestRecord>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE ingest_records
            SET delivery_state = 'in-flight', leased_at = ?
            WHERE seq IN (
                SELECT seq FROM ingest_records
                WHERE delivery_state = 'pending'
                ORDER BY enqueued_at ASC, seq ASC
                LIMIT ?
            )
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(Utc::now().timestamp_millis())
            .bind(i64::try_from(max_size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut drained = rows
            .iter()
            .map(Self::record_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        // RETURNING does not preserve the subquery order
        drained.sort_by_key(|(seq, record)| (record.enqueued_at, *seq));

        debug!("drained {} records", drained.len());
        Ok(drained.into_iter().map(|(_, record)| record).collect())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn mark_delivered(&self, ids: &[String]) -> StorageResult<u64> {
        let set_clause = format!(
            "delivery_state = 'delivered', delivered_at = {}, leased_at = NULL",
            Utc::now().timestamp_millis()
        );
        self.update_in_flight(ids, &set_clause).await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn mark_failed(&self, ids: &[String]) -> StorageResult<u64> {
        self.update_in_flight(
            ids,
            "delivery_state = 'pending', attempts = attempts + 1, leased_at = NULL",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn purge_older_than(
        &self,
        retention: Duration,
        confirmation_grace: Duration,
    ) -> StorageResult<PurgeOutcome> {
        let now = Utc::now();
        let retention_cutoff = cutoff(now, retention).timestamp_millis();
        let delivered_cutoff = cutoff(now, confirmation_grace).timestamp_millis();

        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query("DELETE FROM ingest_records WHERE enqueued_at < ?")
            .bind(retention_cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let confirmed = sqlx::query(
            "DELETE FROM ingest_records WHERE delivery_state = 'delivered' AND delivered_at <= ?",
        )
        .bind(delivered_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if expired > 0 {
            warn!("purged {} undelivered or unconfirmed records past retention", expired);
        }
        debug!("purged {} confirmed records", confirmed);

        Ok(PurgeOutcome { expired, confirmed })
    }

    #[instrument(skip(self))]
    async fn requeue_in_flight(&self, leased_before: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_records
            SET delivery_state = 'pending', leased_at = NULL
            WHERE delivery_state = 'in-flight'
              AND (leased_at IS NULL OR leased_at <= ?)
            "#,
        )
        .bind(leased_before.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn depth(&self) -> StorageResult<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ingest_records WHERE delivery_state != 'delivered'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0.max(0) as u64)
    }

    async fn stats(&self) -> StorageResult<BufferStats> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT delivery_state, COUNT(*) FROM ingest_records GROUP BY delivery_state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = BufferStats::default();
        for (state, count) in counts {
            let count = count.max(0) as u64;
            match DeliveryState::parse(&state) {
                Some(DeliveryState::Pending) => stats.pending = count,
                Some(DeliveryState::InFlight) => stats.in_flight = count,
                Some(DeliveryState::Delivered) => stats.delivered = count,
                None => warn!("ignoring {} rows with unknown state `{}`", count, state),
            }
        }

        let oldest: (Option<i64>,) = sqlx::query_as(
            "SELECT MIN(enqueued_at) FROM ingest_records WHERE delivery_state = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.oldest_pending = oldest.0.map(Self::millis_to_timestamp);

        Ok(stats)
    }

    async fn get(&self, id: &str) -> StorageResult<Option<IngestRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM ingest_records WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(Self::record_from_row)
            .transpose()
            .map(|found| found.map(|(_, record)| record))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite buffer operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("buffer health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite buffer");
        self.pool.close().await;
        Ok(())
    }
}
