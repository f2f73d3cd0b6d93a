//! Postgres-backed processed-event ledger.
//!
//! One row per event id. The primary key doubles as the duplicate guard: a
//! second `save` for the same id hits a unique violation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use eventrelay_core::EventId;
use eventrelay_events::EventEnvelope;

use super::r#trait::{ProcessedEventRecord, ProcessedEventStore, ProcessingStatus, RepositoryError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processed_events (
    event_id     UUID PRIMARY KEY,
    event_type   TEXT NOT NULL,
    status       TEXT NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL,
    retry_count  INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    error        TEXT,
    metadata     JSONB,
    envelope     JSONB
);
CREATE INDEX IF NOT EXISTS processed_events_failed_idx
    ON processed_events (processed_at)
    WHERE status = 'FAILED';
"#;

#[derive(Debug, Clone)]
pub struct PostgresProcessedEventStore {
    pool: Arc<PgPool>,
}

impl PostgresProcessedEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and the retry index if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl ProcessedEventStore for PostgresProcessedEventStore {
    #[instrument(
        skip(self, record),
        fields(event_id = %record.event_id, status = %record.status),
        err
    )]
    async fn save(&self, record: &ProcessedEventRecord) -> Result<(), RepositoryError> {
        let envelope = envelope_json(record)?;

        sqlx::query(
            r#"
            INSERT INTO processed_events (
                event_id,
                event_type,
                status,
                processed_at,
                retry_count,
                error,
                metadata,
                envelope
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.event_id.as_uuid())
        .bind(&record.event_type)
        .bind(record.status.as_str())
        .bind(record.processed_at)
        .bind(retry_count_column(record.retry_count))
        .bind(&record.error)
        .bind(&record.metadata)
        .bind(&envelope)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Duplicate(record.event_id)
            } else {
                map_sqlx_error("save", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id, found = tracing::field::Empty), err)]
    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEventRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT
                event_id,
                event_type,
                status,
                processed_at,
                retry_count,
                error,
                metadata,
                envelope
            FROM processed_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find", e))?;

        Span::current().record("found", row.is_some());
        match row {
            Some(row) => {
                let record_row = ProcessedEventRow::from_row(&row).map_err(|e| {
                    RepositoryError::Serialization(format!("failed to read processed event row: {e}"))
                })?;
                Ok(Some(record_row.try_into()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(
        skip(self, record),
        fields(event_id = %record.event_id, status = %record.status),
        err
    )]
    async fn update(&self, record: &ProcessedEventRecord) -> Result<(), RepositoryError> {
        let envelope = envelope_json(record)?;

        let result = sqlx::query(
            r#"
            UPDATE processed_events
            SET
                event_type = $2,
                status = $3,
                processed_at = $4,
                retry_count = $5,
                error = $6,
                metadata = $7,
                envelope = $8
            WHERE event_id = $1
            "#,
        )
        .bind(record.event_id.as_uuid())
        .bind(&record.event_type)
        .bind(record.status.as_str())
        .bind(record.processed_at)
        .bind(retry_count_column(record.retry_count))
        .bind(&record.error)
        .bind(&record.metadata)
        .bind(&envelope)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(record.event_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(returned = tracing::field::Empty), err)]
    async fn find_failed_for_retry(
        &self,
        limit: usize,
    ) -> Result<Vec<ProcessedEventRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                event_type,
                status,
                processed_at,
                retry_count,
                error,
                metadata,
                envelope
            FROM processed_events
            WHERE status = $1
              AND COALESCE((metadata ->> 'permanent')::boolean, FALSE) = FALSE
              AND COALESCE((metadata ->> 'exhausted')::boolean, FALSE) = FALSE
            ORDER BY processed_at ASC, event_id ASC
            LIMIT $2
            "#,
        )
        .bind(ProcessingStatus::Failed.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_failed_for_retry", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record_row = ProcessedEventRow::from_row(&row).map_err(|e| {
                RepositoryError::Serialization(format!("failed to read processed event row: {e}"))
            })?;
            records.push(record_row.try_into()?);
        }

        Span::current().record("returned", records.len());
        Ok(records)
    }
}

fn retry_count_column(retry_count: u32) -> i32 {
    i32::try_from(retry_count).unwrap_or(i32::MAX)
}

fn envelope_json(record: &ProcessedEventRecord) -> Result<Option<JsonValue>, RepositoryError> {
    record
        .envelope
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| RepositoryError::Serialization(format!("failed to encode envelope: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Map SQLx errors to RepositoryError. Unique violations are handled by the caller,
/// which knows the event id.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            RepositoryError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct ProcessedEventRow {
    event_id: Uuid,
    event_type: String,
    status: String,
    processed_at: DateTime<Utc>,
    retry_count: i32,
    error: Option<String>,
    metadata: Option<JsonValue>,
    envelope: Option<JsonValue>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ProcessedEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProcessedEventRow {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            status: row.try_get("status")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: row.try_get("retry_count")?,
            error: row.try_get("error")?,
            metadata: row.try_get("metadata")?,
            envelope: row.try_get("envelope")?,
        })
    }
}

impl TryFrom<ProcessedEventRow> for ProcessedEventRecord {
    type Error = RepositoryError;

    fn try_from(row: ProcessedEventRow) -> Result<Self, Self::Error> {
        let envelope = row
            .envelope
            .map(serde_json::from_value::<EventEnvelope>)
            .transpose()
            .map_err(|e| RepositoryError::Serialization(format!("failed to decode envelope: {e}")))?;

        Ok(ProcessedEventRecord {
            event_id: EventId::from_uuid(row.event_id),
            event_type: row.event_type,
            status: row.status.parse()?,
            processed_at: row.processed_at,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            error: row.error,
            metadata: row.metadata,
            envelope,
        })
    }
}
