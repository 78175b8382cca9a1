use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compliance::MessagePurpose;
use crate::domain::OrgId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

pub const STATUS_RECEIVED: &str = "received";
pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_SENT: &str = "sent";
pub const STATUS_DELIVERED: &str = "delivered";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_RETRY_PENDING: &str = "retry_pending";
pub const STATUS_SUPPRESSED: &str = "suppressed";

/// Provider receipt statuses that mean the carrier gave up on a message.
pub const FAILURE_RECEIPT_STATUSES: &[&str] =
    &["undelivered", "failed", "delivery_failed", "sending_failed"];

pub fn is_failure_receipt(status: &str) -> bool {
    FAILURE_RECEIPT_STATUSES.contains(&status)
}

/// Statuses a late, non-final receipt must not overwrite.
pub fn is_settled_status(status: &str) -> bool {
    matches!(status, STATUS_DELIVERED | STATUS_FAILED | STATUS_RETRY_PENDING | STATUS_SUPPRESSED)
}

/// A message row as written by the ingestion and send paths. The body is
/// always the redacted text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub org_id: OrgId,
    pub direction: MessageDirection,
    pub from: String,
    pub to: String,
    pub body: String,
    pub media: Vec<String>,
    /// Outbound only; decides which gates a resend must pass again.
    pub purpose: MessagePurpose,
    pub provider_status: String,
    pub provider_message_id: Option<String>,
    pub send_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn inbound(
        org_id: OrgId,
        provider_message_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<String>,
        media: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId(uuid::Uuid::new_v4().to_string()),
            org_id,
            direction: MessageDirection::Inbound,
            from: from.into(),
            to: to.into(),
            body: body.into(),
            media,
            purpose: MessagePurpose::Transactional,
            provider_status: STATUS_RECEIVED.to_string(),
            provider_message_id: Some(provider_message_id.into()),
            send_attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            delivered_at: None,
            failed_at: None,
            created_at: now,
        }
    }

    pub fn outbound(
        org_id: OrgId,
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId(uuid::Uuid::new_v4().to_string()),
            org_id,
            direction: MessageDirection::Outbound,
            from: from.into(),
            to: to.into(),
            body: body.into(),
            media: Vec::new(),
            purpose: MessagePurpose::Transactional,
            provider_status: STATUS_QUEUED.to_string(),
            provider_message_id: None,
            send_attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            delivered_at: None,
            failed_at: None,
            created_at: now,
        }
    }
}

/// Suppression reason for an outbound send that was never attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suppression {
    OptOut,
    QuietHours,
}
