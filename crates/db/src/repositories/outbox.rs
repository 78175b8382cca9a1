use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use ringback_core::domain::event::OutboxEnvelope;

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Read side of the outbox written by
/// [`super::SqlMessagingStore::append_canonical_event`].
#[derive(Clone)]
pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Undelivered rows in write order.
    pub async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxEnvelope>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, aggregate, event_type, payload_json, correlation_id, created_at
             FROM outbox
             WHERE delivered_at IS NULL
             ORDER BY created_at ASC, id ASC
             LIMIT ?",
        )
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(envelope_from_row).collect()
    }

    pub async fn mark_delivered(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE outbox SET delivered_at = ? WHERE id = ? AND delivered_at IS NULL",
        )
        .bind(format_timestamp(at))
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn pending_count(&self) -> Result<i64, RepositoryError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE delivered_at IS NULL")
            .fetch_one(&self.pool)
            .await?)
    }
}

fn envelope_from_row(row: SqliteRow) -> Result<OutboxEnvelope, RepositoryError> {
    let payload_json = row.try_get::<String, _>("payload_json")?;
    let payload: Value = serde_json::from_str(&payload_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid outbox payload: {error}")))?;
    let created_at = parse_timestamp("created_at", row.try_get("created_at")?)?;

    Ok(OutboxEnvelope {
        event_id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        aggregate: row.try_get("aggregate")?,
        timestamp: created_at.timestamp_micros(),
        correlation_id: row.try_get("correlation_id")?,
        payload,
    })
}
