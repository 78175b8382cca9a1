use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use ringback_core::domain::conversation::ConversationResponse;
use ringback_core::domain::job::{ConversationJob, JobId};
use ringback_core::domain::lead::{DepositStatus, Lead, LeadId, SchedulingPreferences};
use ringback_core::domain::OrgId;

pub mod jobs;
pub mod leads;
pub mod memory;
pub mod messaging;
pub mod outbox;
pub mod processed;

pub use jobs::SqlConversationJobRepository;
pub use leads::SqlLeadRepository;
pub use memory::{
    InMemoryConversationJobRepository, InMemoryLeadRepository, InMemoryProcessedEventStore,
};
pub use messaging::{AppendOutcome, ClinicRoute, InsertOutcome, ReceiptOutcome, SqlMessagingStore};
pub use outbox::SqlOutboxRepository;
pub use processed::SqlProcessedEventStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Unified lead identity: one lead per (tenant, canonical phone) regardless
/// of the channel the patient used first.
#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn get_or_create_by_phone(
        &self,
        org_id: &OrgId,
        phone: &str,
        source: &str,
        default_name: &str,
    ) -> Result<Lead, RepositoryError>;

    async fn find_by_id(&self, org_id: &OrgId, id: &LeadId) -> Result<Option<Lead>, RepositoryError>;

    async fn update_scheduling_preferences(
        &self,
        id: &LeadId,
        preferences: SchedulingPreferences,
    ) -> Result<bool, RepositoryError>;

    async fn update_deposit_status(
        &self,
        id: &LeadId,
        status: DepositStatus,
        priority_level: Option<String>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ConversationJobRepository: Send + Sync {
    /// Records a pending job unless one with the same id exists. Returns
    /// whether this call created it.
    async fn put_pending(&self, job: ConversationJob) -> Result<bool, RepositoryError>;

    async fn mark_completed(
        &self,
        id: &JobId,
        response: ConversationResponse,
    ) -> Result<(), RepositoryError>;

    async fn mark_failed(&self, id: &JobId, error: &str) -> Result<(), RepositoryError>;

    /// Drops a job that never reached the queue so the same id can be
    /// published again. Only a still-pending row is removed.
    async fn release_pending(&self, id: &JobId) -> Result<(), RepositoryError>;

    /// A missing job is `Ok(None)`, never an error.
    async fn find_by_id(&self, id: &JobId) -> Result<Option<ConversationJob>, RepositoryError>;
}

/// Webhook-level dedup keyed by `(provider, event id)`.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn already_processed(&self, provider: &str, event_id: &str)
        -> Result<bool, RepositoryError>;

    /// Insert-or-ignore. Returns whether this call recorded the event.
    async fn mark_processed(&self, provider: &str, event_id: &str) -> Result<bool, RepositoryError>;
}

/// Leads created from a bare phone number are named after it.
pub(crate) fn lead_display_name(default_name: &str, canonical_phone: &str) -> String {
    let trimmed = default_name.trim();
    if trimmed.is_empty() {
        format!("+{canonical_phone}")
    } else {
        trimmed.to_string()
    }
}

pub fn processed_event_key(provider: &str, event_id: &str) -> String {
    format!("{}:{}", provider.trim(), event_id.trim())
}

/// Fixed-width UTC timestamps so that string comparison in SQL orders them
/// chronologically.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}
