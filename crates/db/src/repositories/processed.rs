use async_trait::async_trait;
use chrono::Utc;

use super::{format_timestamp, processed_event_key, ProcessedEventStore, RepositoryError};
use crate::DbPool;

#[derive(Clone)]
pub struct SqlProcessedEventStore {
    pool: DbPool,
}

impl SqlProcessedEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventStore for SqlProcessedEventStore {
    async fn already_processed(
        &self,
        provider: &str,
        event_id: &str,
    ) -> Result<bool, RepositoryError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processed_events WHERE event_key = ?")
                .bind(processed_event_key(provider, event_id))
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    async fn mark_processed(&self, provider: &str, event_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO processed_events (event_key, provider, event_id, processed_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(event_key) DO NOTHING",
        )
        .bind(processed_event_key(provider, event_id))
        .bind(provider.trim())
        .bind(event_id.trim())
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::SqlProcessedEventStore;
    use crate::repositories::ProcessedEventStore;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn marking_is_insert_or_ignore() {
        let pool = setup_pool().await;
        let store = SqlProcessedEventStore::new(pool.clone());

        assert!(!store.already_processed("telnyx", "evt-1").await.expect("check"));
        assert!(store.mark_processed("telnyx", "evt-1").await.expect("mark"));
        assert!(!store.mark_processed("telnyx", " evt-1 ").await.expect("mark again"));
        assert!(store.already_processed("telnyx", "evt-1").await.expect("check"));

        // Keys are scoped by provider.
        assert!(!store.already_processed("other", "evt-1").await.expect("check"));
        pool.close().await;
    }
}
