use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use ringback_core::compliance::{ComplianceEngine, MessagePurpose};
use ringback_core::domain::event::{clinic_stream, CanonicalEvent, MessageSentV1, PROVIDER_TELNYX};
use ringback_core::domain::message::{
    MessageId, MessageRecord, Suppression, STATUS_RETRY_PENDING, STATUS_SUPPRESSED,
};
use ringback_core::domain::OrgId;
use ringback_core::phone::normalize_e164;
use ringback_core::RetryPolicy;
use ringback_db::repositories::{RepositoryError, SqlMessagingStore};

use crate::provider::{MessageSender, OutboundRequest, SendError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { message_id: MessageId, provider_message_id: String },
    Suppressed { message_id: MessageId, reason: Suppression },
    RetryScheduled { message_id: MessageId, next_retry_at: DateTime<Utc>, error: String },
}

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("recipient `{0}` has no usable phone number")]
    InvalidRecipient(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("outbound event encode failed: {0}")]
    Encode(String),
}

/// One outbound SMS with everything needed to persist it.
#[derive(Clone, Debug)]
pub struct OutboundMessage<'a> {
    pub org_id: &'a OrgId,
    pub from: &'a str,
    pub to: &'a str,
    pub body: &'a str,
    pub purpose: MessagePurpose,
    pub template_name: Option<&'a str>,
    pub correlation_id: Option<&'a str>,
}

/// Sends SMS on behalf of a tenant. Every attempt, sent, suppressed or
/// deferred, leaves one message row and one `MessageSentV1` event.
#[derive(Clone)]
pub struct OutboundMessenger {
    store: SqlMessagingStore,
    sender: Arc<dyn MessageSender>,
    compliance: Arc<ComplianceEngine>,
    policy: RetryPolicy,
    send_timeout: Duration,
    profile_id: Option<String>,
}

impl OutboundMessenger {
    pub fn new(
        store: SqlMessagingStore,
        sender: Arc<dyn MessageSender>,
        compliance: Arc<ComplianceEngine>,
        policy: RetryPolicy,
        send_timeout: Duration,
        profile_id: Option<String>,
    ) -> Self {
        Self { store, sender, compliance, policy, send_timeout, profile_id }
    }

    pub fn sender(&self) -> &Arc<dyn MessageSender> {
        &self.sender
    }

    pub fn profile_id(&self) -> Option<&str> {
        self.profile_id.as_deref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn deliver(&self, message: OutboundMessage<'_>) -> Result<DeliveryOutcome, OutboundError> {
        let to = normalize_e164(message.to);
        if to.is_empty() {
            return Err(OutboundError::InvalidRecipient(message.to.to_string()));
        }
        let now = Utc::now();
        let suppression = self.suppression(message.org_id, &to, message.purpose, now).await?;

        let mut record =
            MessageRecord::outbound(message.org_id.clone(), message.from, to.clone(), message.body, now);
        record.purpose = message.purpose;

        let outcome = match suppression {
            Some(reason) => {
                record.provider_status = STATUS_SUPPRESSED.to_string();
                DeliveryOutcome::Suppressed { message_id: record.id.clone(), reason }
            }
            None => match self.attempt(message.from, &to, message.body).await {
                Ok(receipt) => {
                    record.provider_status = receipt.status;
                    record.provider_message_id = Some(receipt.provider_message_id.clone());
                    record.send_attempts = 1;
                    record.last_attempt_at = Some(now);
                    DeliveryOutcome::Sent {
                        message_id: record.id.clone(),
                        provider_message_id: receipt.provider_message_id,
                    }
                }
                Err(error) => {
                    let next_retry_at = self.policy.first_retry_at(now);
                    record.provider_status = STATUS_RETRY_PENDING.to_string();
                    record.send_attempts = 1;
                    record.last_attempt_at = Some(now);
                    record.next_retry_at = Some(next_retry_at);
                    DeliveryOutcome::RetryScheduled {
                        message_id: record.id.clone(),
                        next_retry_at,
                        error: error.to_string(),
                    }
                }
            },
        };

        let event = CanonicalEvent::MessageSent(MessageSentV1 {
            message_id: record.id.0.clone(),
            clinic_id: message.org_id.to_string(),
            from_e164: record.from.clone(),
            to_e164: record.to.clone(),
            body: record.body.clone(),
            provider: PROVIDER_TELNYX.to_string(),
            sent_at: now,
            quiet_hours_suppressed: suppression == Some(Suppression::QuietHours),
            opt_out_suppressed: suppression == Some(Suppression::OptOut),
            template_name: message.template_name.map(str::to_string),
            provider_message_id: record.provider_message_id.clone(),
        });

        let mut tx = self.store.begin().await?;
        self.store.insert_message(&mut tx, &record).await?;
        self.store
            .append_canonical_event(
                &mut tx,
                &clinic_stream(message.org_id.as_str()),
                &record.id.0,
                &event,
                message.correlation_id,
            )
            .await?;
        tx.commit().await.map_err(RepositoryError::from)?;

        match &outcome {
            DeliveryOutcome::Sent { message_id, provider_message_id } => info!(
                event_name = "messaging.outbound.sent",
                org_id = %message.org_id,
                message_id = %message_id.0,
                provider_message_id = %provider_message_id,
                template = message.template_name.unwrap_or("reply"),
                "outbound message sent"
            ),
            DeliveryOutcome::Suppressed { message_id, reason } => info!(
                event_name = "messaging.outbound.suppressed",
                org_id = %message.org_id,
                message_id = %message_id.0,
                reason = ?reason,
                "outbound message suppressed"
            ),
            DeliveryOutcome::RetryScheduled { message_id, next_retry_at, error } => warn!(
                event_name = "messaging.outbound.retry_scheduled",
                org_id = %message.org_id,
                message_id = %message_id.0,
                next_retry_at = %next_retry_at,
                error = %error,
                "outbound send failed, retry scheduled"
            ),
        }

        Ok(outcome)
    }

    /// The gate every send and resend passes: opt-out for anything but
    /// compliance traffic, then quiet hours.
    pub async fn suppression(
        &self,
        org_id: &OrgId,
        to: &str,
        purpose: MessagePurpose,
        now: DateTime<Utc>,
    ) -> Result<Option<Suppression>, RepositoryError> {
        if purpose != MessagePurpose::Compliance && self.store.is_unsubscribed(org_id, to).await? {
            return Ok(Some(Suppression::OptOut));
        }
        if self.compliance.is_quiet(now, purpose) {
            return Ok(Some(Suppression::QuietHours));
        }
        Ok(None)
    }

    /// One provider call bounded by the send sub-timeout.
    pub async fn attempt(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<crate::provider::SendReceipt, SendError> {
        let request = OutboundRequest {
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            media: Vec::new(),
            profile_id: self.profile_id.clone(),
        };
        match tokio::time::timeout(self.send_timeout, self.sender.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(self.send_timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use ringback_core::compliance::{
        AckRenderer, AckTemplates, ComplianceEngine, KeywordDetector, MessagePurpose, QuietHours,
    };
    use ringback_core::domain::message::{MessageDirection, Suppression};
    use ringback_core::domain::OrgId;
    use ringback_core::RetryPolicy;
    use ringback_db::repositories::{SqlMessagingStore, SqlOutboxRepository};
    use ringback_db::{connect_with_settings, migrations, DbPool};

    use super::{DeliveryOutcome, OutboundMessage, OutboundMessenger};
    use crate::provider::RecordingSender;

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn messenger(pool: &DbPool, sender: Arc<RecordingSender>, engine: ComplianceEngine) -> OutboundMessenger {
        OutboundMessenger::new(
            SqlMessagingStore::new(pool.clone()),
            sender,
            Arc::new(engine),
            RetryPolicy::default(),
            Duration::from_secs(3),
            None,
        )
    }

    fn message<'a>(org: &'a OrgId, body: &'a str, purpose: MessagePurpose) -> OutboundMessage<'a> {
        OutboundMessage {
            org_id: org,
            from: "+15559998888",
            to: "5550001111",
            body,
            purpose,
            template_name: None,
            correlation_id: None,
        }
    }

    /// A two-hour window centred on the current UTC time.
    fn always_quiet() -> ComplianceEngine {
        let now = Utc::now();
        let start = (now - ChronoDuration::hours(1)).format("%H:%M").to_string();
        let end = (now + ChronoDuration::hours(1)).format("%H:%M").to_string();
        ComplianceEngine::new(
            KeywordDetector::default(),
            Some(QuietHours::new(&start, &end, "UTC").expect("quiet hours")),
            AckRenderer::new(AckTemplates::default()).expect("acks"),
        )
    }

    #[tokio::test]
    async fn successful_send_persists_message_and_event() {
        let pool = setup_pool().await;
        let sender = Arc::new(RecordingSender::new());
        let messenger = messenger(&pool, sender.clone(), ComplianceEngine::default());
        let org = OrgId::from("org-1");

        let outcome = messenger
            .deliver(message(&org, "See you soon", MessagePurpose::Transactional))
            .await
            .expect("deliver");
        assert!(matches!(outcome, DeliveryOutcome::Sent { .. }));
        assert_eq!(sender.sent().await[0].to, "+15550001111");

        let store = SqlMessagingStore::new(pool.clone());
        let stored = store.list_messages(&org, Some(MessageDirection::Outbound)).await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].send_attempts, 1);
        assert!(stored[0].provider_message_id.is_some());

        let outbox = SqlOutboxRepository::new(pool.clone()).fetch_pending(10).await.expect("outbox");
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, "messaging.message.sent.v1");
        pool.close().await;
    }

    #[tokio::test]
    async fn failed_send_becomes_retry_pending() {
        let pool = setup_pool().await;
        let sender = Arc::new(RecordingSender::failing());
        let messenger = messenger(&pool, sender, ComplianceEngine::default());
        let org = OrgId::from("org-1");

        let outcome = messenger
            .deliver(message(&org, "Thanks!", MessagePurpose::Transactional))
            .await
            .expect("deliver");
        let DeliveryOutcome::RetryScheduled { message_id, next_retry_at, .. } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };

        let stored = SqlMessagingStore::new(pool.clone())
            .get_message(&message_id)
            .await
            .expect("find")
            .expect("message");
        assert_eq!(stored.provider_status, "retry_pending");
        assert_eq!(stored.send_attempts, 1);
        assert!(stored.last_attempt_at.is_some());
        let delay = next_retry_at - stored.last_attempt_at.expect("attempt time");
        assert_eq!(delay.num_seconds(), 300);
        pool.close().await;
    }

    #[tokio::test]
    async fn quiet_hours_only_hold_back_marketing() {
        let pool = setup_pool().await;
        let sender = Arc::new(RecordingSender::new());
        let messenger = messenger(&pool, sender.clone(), always_quiet());
        let org = OrgId::from("org-1");

        let marketing = messenger
            .deliver(message(&org, "Spring special!", MessagePurpose::Marketing))
            .await
            .expect("deliver");
        assert!(matches!(
            marketing,
            DeliveryOutcome::Suppressed { reason: Suppression::QuietHours, .. }
        ));

        let reply = messenger
            .deliver(message(&org, "Your appointment is confirmed", MessagePurpose::Transactional))
            .await
            .expect("deliver");
        assert!(matches!(reply, DeliveryOutcome::Sent { .. }));
        assert_eq!(sender.bodies().await, vec!["Your appointment is confirmed".to_string()]);
        pool.close().await;
    }

    #[tokio::test]
    async fn opt_out_blocks_everything_but_compliance_sends() {
        let pool = setup_pool().await;
        let store = SqlMessagingStore::new(pool.clone());
        let org = OrgId::from("org-1");
        let mut tx = store.begin().await.expect("begin");
        store.insert_unsubscribe(&mut tx, &org, "+15550001111", "STOP").await.expect("unsubscribe");
        tx.commit().await.expect("commit");

        let sender = Arc::new(RecordingSender::new());
        let messenger = messenger(&pool, sender.clone(), ComplianceEngine::default());

        let reply = messenger
            .deliver(message(&org, "Following up", MessagePurpose::Transactional))
            .await
            .expect("deliver");
        assert!(matches!(reply, DeliveryOutcome::Suppressed { reason: Suppression::OptOut, .. }));

        let ack = messenger
            .deliver(message(&org, "You are unsubscribed", MessagePurpose::Compliance))
            .await
            .expect("deliver");
        assert!(matches!(ack, DeliveryOutcome::Sent { .. }));
        assert_eq!(sender.sent().await.len(), 1);
        pool.close().await;
    }
}
