use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use ringback_core::domain::message::{
    MessageRecord, Suppression, STATUS_FAILED, STATUS_RETRY_PENDING,
};
use ringback_core::retry::{RetryOutcome, RetryPolicy};
use ringback_db::repositories::{RepositoryError, SqlMessagingStore};

use crate::outbound::OutboundMessenger;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Recipient opted out since the first attempt; closed without sending.
    pub suppressed: usize,
    /// Held back by quiet hours; picked up again on a later tick.
    pub deferred: usize,
}

/// Periodically resends outbound messages left in `retry_pending` or
/// `failed` by an earlier attempt.
#[derive(Clone)]
pub struct RetrySweeper {
    store: SqlMessagingStore,
    messenger: OutboundMessenger,
    policy: RetryPolicy,
    batch: u32,
    interval: Duration,
}

impl RetrySweeper {
    pub fn new(
        store: SqlMessagingStore,
        messenger: OutboundMessenger,
        policy: RetryPolicy,
        batch: u32,
        interval: Duration,
    ) -> Self {
        Self { store, messenger, policy, batch: batch.max(1), interval }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<SweepReport, RepositoryError> {
        let candidates =
            self.store.list_retry_candidates(self.batch, self.policy.max_attempts, now).await?;
        let mut report = SweepReport::default();
        for message in candidates {
            report.attempted += 1;
            match self.resend(&message, now).await? {
                ResendResult::Sent => report.sent += 1,
                ResendResult::Rescheduled => report.rescheduled += 1,
                ResendResult::Exhausted => report.exhausted += 1,
                ResendResult::Suppressed => report.suppressed += 1,
                ResendResult::Deferred => report.deferred += 1,
            }
        }
        Ok(report)
    }

    async fn resend(&self, message: &MessageRecord, now: DateTime<Utc>) -> Result<ResendResult, RepositoryError> {
        match self.messenger.suppression(&message.org_id, &message.to, message.purpose, now).await? {
            Some(Suppression::OptOut) => {
                let mut tx = self.store.begin().await?;
                self.store.mark_suppressed(&mut tx, &message.id).await?;
                tx.commit().await?;
                info!(
                    event_name = "messaging.retry.suppressed",
                    org_id = %message.org_id,
                    message_id = %message.id.0,
                    "recipient opted out, pending resend dropped"
                );
                return Ok(ResendResult::Suppressed);
            }
            Some(Suppression::QuietHours) => return Ok(ResendResult::Deferred),
            None => {}
        }

        let attempt = self.messenger.attempt(&message.from, &message.to, &message.body).await;
        let mut tx = self.store.begin().await?;
        let result = match attempt {
            Ok(receipt) => {
                self.store
                    .mark_sent(&mut tx, &message.id, &receipt.provider_message_id, &receipt.status, now)
                    .await?;
                ResendResult::Sent
            }
            Err(send_error) => match self.policy.outcome_after_failure(message.send_attempts, now) {
                RetryOutcome::Retry { attempts, next_retry_at } => {
                    self.store
                        .schedule_retry(&mut tx, &message.id, STATUS_RETRY_PENDING, Some(next_retry_at), now)
                        .await?;
                    warn!(
                        event_name = "messaging.retry.rescheduled",
                        message_id = %message.id.0,
                        attempts,
                        next_retry_at = %next_retry_at,
                        error = %send_error,
                        "outbound retry failed, rescheduled"
                    );
                    ResendResult::Rescheduled
                }
                RetryOutcome::Exhausted { attempts } => {
                    self.store.schedule_retry(&mut tx, &message.id, STATUS_FAILED, None, now).await?;
                    error!(
                        event_name = "messaging.retry.exhausted",
                        message_id = %message.id.0,
                        attempts,
                        error = %send_error,
                        "outbound message permanently failed"
                    );
                    ResendResult::Exhausted
                }
            },
        };
        tx.commit().await?;
        Ok(result)
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
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.attempted > 0 => info!(
                            event_name = "messaging.retry.sweep",
                            attempted = report.attempted,
                            sent = report.sent,
                            rescheduled = report.rescheduled,
                            exhausted = report.exhausted,
                            "retry sweep finished"
                        ),
                        Ok(_) => {}
                        Err(error) => error!(
                            event_name = "messaging.retry.sweep_failed",
                            error = %error,
                            "retry sweep failed"
                        ),
                    }
                }
            }
        }
    }
}

enum ResendResult {
    Sent,
    Rescheduled,
    Exhausted,
    Suppressed,
    Deferred,
}
