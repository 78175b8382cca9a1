use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use ringback_core::domain::event::OutboxEnvelope;
use ringback_db::repositories::{RepositoryError, SqlOutboxRepository};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("outbox sink rejected event: {0}")]
pub struct SinkError(pub String);

/// Downstream consumer of committed canonical events.
#[async_trait]
pub trait OutboxSink: Send + Sync {
    async fn publish(&self, envelope: &OutboxEnvelope) -> Result<(), SinkError>;
}

/// Default sink: one structured log line per event.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingOutboxSink;

#[async_trait]
impl OutboxSink for LoggingOutboxSink {
    async fn publish(&self, envelope: &OutboxEnvelope) -> Result<(), SinkError> {
        info!(
            event_name = "outbox.event.published",
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            aggregate = %envelope.aggregate,
            correlation_id = envelope.correlation_id.as_deref().unwrap_or(""),
            "outbox event published"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct OutboxRelay {
    outbox: SqlOutboxRepository,
    sink: Arc<dyn OutboxSink>,
    batch: u32,
    interval: Duration,
}

impl OutboxRelay {
    pub fn new(outbox: SqlOutboxRepository, sink: Arc<dyn OutboxSink>, batch: u32, interval: Duration) -> Self {
        Self { outbox, sink, batch: batch.max(1), interval }
    }

    /// Publishes one batch in write order. Stops at the first sink failure so
    /// later events are never delivered ahead of an earlier one.
    pub async fn drain_once(&self) -> Result<usize, RepositoryError> {
        let pending = self.outbox.fetch_pending(self.batch).await?;
        let mut delivered = 0;
        for envelope in pending {
            if let Err(sink_error) = self.sink.publish(&envelope).await {
                warn!(
                    event_name = "outbox.event.publish_failed",
                    event_id = %envelope.event_id,
                    error = %sink_error,
                    "outbox sink failed, will retry next pass"
                );
                break;
            }
            self.outbox.mark_delivered(&envelope.event_id, Utc::now()).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.drain_once().await {
                        error!(
                            event_name = "outbox.relay.failed",
                            error = %error,
                            "outbox relay pass failed"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use ringback_core::domain::event::{clinic_stream, CanonicalEvent, HostedOrderActivatedV1, OutboxEnvelope};
    use ringback_db::repositories::{SqlMessagingStore, SqlOutboxRepository};
    use ringback_db::{connect_with_settings, migrations, DbPool};

    use super::{LoggingOutboxSink, OutboxRelay, OutboxSink, SinkError};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    async fn append(pool: &DbPool, key: &str) {
        let store = SqlMessagingStore::new(pool.clone());
        let event = CanonicalEvent::HostedOrderActivated(HostedOrderActivatedV1 {
            order_id: key.to_string(),
            clinic_id: "org-1".to_string(),
            e164_number: "+15559998888".to_string(),
            activated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        });
        let mut tx = store.begin().await.expect("begin");
        store
            .append_canonical_event(&mut tx, &clinic_stream("org-1"), key, &event, None)
            .await
            .expect("append");
        tx.commit().await.expect("commit");
    }

    /// Accepts the first `limit` events, then fails.
    struct FlakySink {
        accepted: AtomicUsize,
        limit: usize,
    }

    #[async_trait]
    impl OutboxSink for FlakySink {
        async fn publish(&self, _envelope: &OutboxEnvelope) -> Result<(), SinkError> {
            if self.accepted.load(Ordering::SeqCst) >= self.limit {
                return Err(SinkError("broker unavailable".to_string()));
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn relay_marks_published_events_delivered() {
        let pool = setup_pool().await;
        append(&pool, "order-1").await;
        append(&pool, "order-2").await;

        let outbox = SqlOutboxRepository::new(pool.clone());
        let relay = OutboxRelay::new(outbox.clone(), Arc::new(LoggingOutboxSink), 10, Duration::from_secs(1));
        assert_eq!(relay.drain_once().await.expect("drain"), 2);
        assert_eq!(outbox.pending_count().await.expect("count"), 0);
        assert_eq!(relay.drain_once().await.expect("drain"), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn sink_failure_leaves_rest_pending() {
        let pool = setup_pool().await;
        for key in ["order-1", "order-2", "order-3"] {
            append(&pool, key).await;
        }

        let outbox = SqlOutboxRepository::new(pool.clone());
        let sink = Arc::new(FlakySink { accepted: AtomicUsize::new(0), limit: 1 });
        let relay = OutboxRelay::new(outbox.clone(), sink, 10, Duration::from_secs(1));
        assert_eq!(relay.drain_once().await.expect("drain"), 1);
        assert_eq!(outbox.pending_count().await.expect("count"), 2);
        pool.close().await;
    }
}
