//! Repository for dead-letter records.
//!
//! Rows are keyed by event id so a repeated failure of the same event upserts
//! one record. Reads used by recovery are ordered by `(created_at, event_id)`
//! to keep offset pagination deterministic.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{types::Json, Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{DeadLetterParts, DeadLetterRecord, DeadLetterStatus, EventId, FailureContext},
};

const SELECT_COLUMNS: &str = r#"
    SELECT event_id, topic, event_key, value, trace_id, headers, published_at,
           error_message, error_kind, cause_kind, stack_snapshot,
           partition, event_offset, retry_count, is_retryable, next_retry_at,
           status, recovered_partition, recovered_offset, created_at
    FROM dead_letter_events
"#;

/// Table row for `dead_letter_events`.
#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    event_id: EventId,
    topic: String,
    event_key: String,
    value: String,
    trace_id: String,
    headers: Json<HashMap<String, String>>,
    published_at: DateTime<Utc>,
    error_message: String,
    error_kind: String,
    cause_kind: Option<String>,
    stack_snapshot: Option<String>,
    partition: Option<i32>,
    event_offset: Option<i64>,
    retry_count: i32,
    is_retryable: bool,
    next_retry_at: Option<DateTime<Utc>>,
    status: DeadLetterStatus,
    recovered_partition: Option<i32>,
    recovered_offset: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = CoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        let retry_count = u32::try_from(row.retry_count).map_err(|_| {
            CoreError::InvalidState(format!(
                "dead letter {} has negative retry_count {}",
                row.event_id, row.retry_count
            ))
        })?;

        DeadLetterRecord::reconstitute(DeadLetterParts {
            event_id: row.event_id,
            topic: row.topic,
            key: row.event_key,
            value: row.value,
            trace_id: row.trace_id,
            headers: row.headers.0,
            timestamp: row.published_at,
            failure: FailureContext {
                error_message: row.error_message,
                error_kind: row.error_kind,
                cause_kind: row.cause_kind,
                stack_snapshot: row.stack_snapshot,
            },
            partition: row.partition,
            offset: row.event_offset,
            retry_count,
            retryable: row.is_retryable,
            next_retry_at: row.next_retry_at,
            status: row.status,
            recovered_partition: row.recovered_partition,
            recovered_offset: row.recovered_offset,
            created_at: row.created_at,
        })
    }
}

fn into_records(rows: Vec<DeadLetterRow>) -> Result<Vec<DeadLetterRecord>> {
    rows.into_iter().map(DeadLetterRecord::try_from).collect()
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Repository for dead-letter database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Starts a transaction for single-row read-modify-write updates.
    ///
    /// # Errors
    ///
    /// Returns error if a connection cannot be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Inserts a dead letter, or replaces the existing one with the same
    /// event id.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub async fn upsert(&self, record: &DeadLetterRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_events (
                event_id, topic, event_key, value, trace_id, headers, published_at,
                error_message, error_kind, cause_kind, stack_snapshot,
                partition, event_offset, retry_count, is_retryable, next_retry_at,
                status, recovered_partition, recovered_offset, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, NOW()
            )
            ON CONFLICT (event_id) DO UPDATE SET
                topic = EXCLUDED.topic,
                event_key = EXCLUDED.event_key,
                value = EXCLUDED.value,
                trace_id = EXCLUDED.trace_id,
                headers = EXCLUDED.headers,
                published_at = EXCLUDED.published_at,
                error_message = EXCLUDED.error_message,
                error_kind = EXCLUDED.error_kind,
                cause_kind = EXCLUDED.cause_kind,
                stack_snapshot = EXCLUDED.stack_snapshot,
                partition = EXCLUDED.partition,
                event_offset = EXCLUDED.event_offset,
                retry_count = EXCLUDED.retry_count,
                is_retryable = EXCLUDED.is_retryable,
                next_retry_at = EXCLUDED.next_retry_at,
                status = EXCLUDED.status,
                recovered_partition = EXCLUDED.recovered_partition,
                recovered_offset = EXCLUDED.recovered_offset,
                updated_at = NOW()
            "#,
        )
        .bind(record.event_id())
        .bind(record.topic())
        .bind(record.key())
        .bind(record.value())
        .bind(record.trace_id())
        .bind(Json(record.headers()))
        .bind(record.timestamp())
        .bind(&record.failure().error_message)
        .bind(&record.failure().error_kind)
        .bind(&record.failure().cause_kind)
        .bind(&record.failure().stack_snapshot)
        .bind(record.partition())
        .bind(record.offset())
        .bind(to_i32(record.retry_count()))
        .bind(record.is_retryable())
        .bind(record.next_retry_at())
        .bind(record.status().as_str())
        .bind(record.recovered_partition())
        .bind(record.recovered_offset())
        .bind(record.created_at())
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a dead letter by event id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored row is inconsistent.
    pub async fn find_by_id(&self, event_id: &EventId) -> Result<Option<DeadLetterRecord>> {
        self.find_by_id_impl(&*self.pool, event_id, false).await
    }

    /// Finds and row-locks a dead letter inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored row is inconsistent.
    pub async fn find_by_id_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: &EventId,
    ) -> Result<Option<DeadLetterRecord>> {
        self.find_by_id_impl(&mut **tx, event_id, true).await
    }

    async fn find_by_id_impl<'e, E>(
        &self,
        executor: E,
        event_id: &EventId,
        for_update: bool,
    ) -> Result<Option<DeadLetterRecord>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lock = if for_update { "FOR UPDATE" } else { "" };
        let sql = format!("{SELECT_COLUMNS} WHERE event_id = $1 {lock}");

        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(event_id)
            .fetch_optional(executor)
            .await?;

        row.map(DeadLetterRecord::try_from).transpose()
    }

    /// Pages through dead letters with the given status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_status(
        &self,
        status: DeadLetterStatus,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY created_at ASC, event_id ASC \
             OFFSET $2 LIMIT $3"
        );

        let rows = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(status.as_str())
            .bind(to_i64(offset))
            .bind(to_i64(limit))
            .fetch_all(&*self.pool)
            .await?;

        into_records(rows)
    }

    /// Pages through dead letters eligible for automatic recovery.
    ///
    /// Matches on `retryable` and `status` and excludes records at or above
    /// `max_retry`. `next_retry_at` is not consulted.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_recoverable(
        &self,
        retryable: bool,
        status: DeadLetterStatus,
        offset: usize,
        limit: usize,
        max_retry: u32,
    ) -> Result<Vec<DeadLetterRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE is_retryable = $1 AND status = $2 AND retry_count < $3 \
             ORDER BY created_at ASC, event_id ASC OFFSET $4 LIMIT $5"
        );

        let rows = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(retryable)
            .bind(status.as_str())
            .bind(to_i32(max_retry))
            .bind(to_i64(offset))
            .bind(to_i64(limit))
            .fetch_all(&*self.pool)
            .await?;

        into_records(rows)
    }

    /// Marks a dead letter recovered unless it already is.
    ///
    /// Returns `true` if this call changed the row.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_recovered(
        &self,
        event_id: &EventId,
        partition: i32,
        offset: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_events
            SET status = 'recovered', is_retryable = FALSE, next_retry_at = NULL,
                recovered_partition = $2, recovered_offset = $3, updated_at = NOW()
            WHERE event_id = $1 AND status <> 'recovered'
            "#,
        )
        .bind(event_id)
        .bind(partition)
        .bind(offset)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Writes the retry bookkeeping of a record inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_retry_state(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &DeadLetterRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dead_letter_events
            SET retry_count = $2, is_retryable = $3, next_retry_at = $4, updated_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(record.event_id())
        .bind(to_i32(record.retry_count()))
        .bind(record.is_retryable())
        .bind(record.next_retry_at())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Deletes recovered dead letters created before `cutoff`.
    ///
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_recovered_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM dead_letter_events
            WHERE status = 'recovered' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Counts dead letters by status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: DeadLetterStatus) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_events WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }
}
