use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use ringback_core::domain::conversation::ConversationResponse;
use ringback_core::domain::job::{ConversationJob, JobId, JobStatus};
use ringback_core::domain::lead::{DepositStatus, Lead, LeadId, SchedulingPreferences};
use ringback_core::domain::OrgId;
use ringback_core::phone::normalize_e164_digits;

use super::{
    lead_display_name, processed_event_key, ConversationJobRepository, LeadRepository, ProcessedEventStore,
    RepositoryError,
};

#[derive(Default)]
pub struct InMemoryLeadRepository {
    leads: RwLock<HashMap<String, Lead>>,
}

#[async_trait::async_trait]
impl LeadRepository for InMemoryLeadRepository {
    async fn get_or_create_by_phone(
        &self,
        org_id: &OrgId,
        phone: &str,
        source: &str,
        default_name: &str,
    ) -> Result<Lead, RepositoryError> {
        if org_id.as_str().trim().is_empty() {
            return Err(RepositoryError::Validation("lead org_id is required".to_string()));
        }
        let phone = normalize_e164_digits(phone);
        if phone.is_empty() {
            return Err(RepositoryError::Validation("lead phone is required".to_string()));
        }
        let name = lead_display_name(default_name, &phone);

        let mut leads = self.leads.write().await;
        if let Some(existing) =
            leads.values().find(|lead| lead.org_id == *org_id && lead.phone == phone)
        {
            return Ok(existing.clone());
        }

        let lead = Lead {
            id: LeadId(Uuid::new_v4().to_string()),
            org_id: org_id.clone(),
            name,
            email: None,
            phone,
            source: source.to_string(),
            message: None,
            preferences: SchedulingPreferences::default(),
            deposit_status: DepositStatus::None,
            priority_level: None,
            created_at: Utc::now(),
        };
        leads.insert(lead.id.0.clone(), lead.clone());
        Ok(lead)
    }

    async fn find_by_id(&self, org_id: &OrgId, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let leads = self.leads.read().await;
        Ok(leads.get(&id.0).filter(|lead| lead.org_id == *org_id).cloned())
    }

    async fn update_scheduling_preferences(
        &self,
        id: &LeadId,
        preferences: SchedulingPreferences,
    ) -> Result<bool, RepositoryError> {
        let mut leads = self.leads.write().await;
        let Some(lead) = leads.get_mut(&id.0) else {
            return Ok(false);
        };
        let stored = &mut lead.preferences;
        stored.service_interest = preferences.service_interest.or(stored.service_interest.take());
        stored.patient_type = preferences.patient_type.or(stored.patient_type.take());
        stored.preferred_days = preferences.preferred_days.or(stored.preferred_days.take());
        stored.preferred_times = preferences.preferred_times.or(stored.preferred_times.take());
        stored.notes = preferences.notes.or(stored.notes.take());
        Ok(true)
    }

    async fn update_deposit_status(
        &self,
        id: &LeadId,
        status: DepositStatus,
        priority_level: Option<String>,
    ) -> Result<bool, RepositoryError> {
        let mut leads = self.leads.write().await;
        let Some(lead) = leads.get_mut(&id.0) else {
            return Ok(false);
        };
        lead.deposit_status = status;
        if priority_level.is_some() {
            lead.priority_level = priority_level;
        }
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemoryConversationJobRepository {
    jobs: RwLock<HashMap<String, ConversationJob>>,
}

#[async_trait::async_trait]
impl ConversationJobRepository for InMemoryConversationJobRepository {
    async fn put_pending(&self, job: ConversationJob) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id.0) {
            return Ok(false);
        }
        jobs.insert(job.id.0.clone(), job);
        Ok(true)
    }

    async fn mark_completed(
        &self,
        id: &JobId,
        response: ConversationResponse,
    ) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id.0) {
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.response = Some(response);
            job.error = None;
            job.updated_at = now;
            job.completed_at = Some(now);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &JobId, error: &str) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id.0) {
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.response = None;
            job.error = Some(error.to_string());
            job.updated_at = now;
            job.completed_at = Some(now);
        }
        Ok(())
    }

    async fn release_pending(&self, id: &JobId) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if jobs.get(&id.0).is_some_and(|job| job.status == JobStatus::Pending) {
            jobs.remove(&id.0);
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<ConversationJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&id.0).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryProcessedEventStore {
    keys: RwLock<HashSet<String>>,
}

#[async_trait::async_trait]
impl ProcessedEventStore for InMemoryProcessedEventStore {
    async fn already_processed(
        &self,
        provider: &str,
        event_id: &str,
    ) -> Result<bool, RepositoryError> {
        Ok(self.keys.read().await.contains(&processed_event_key(provider, event_id)))
    }

    async fn mark_processed(&self, provider: &str, event_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.keys.write().await.insert(processed_event_key(provider, event_id)))
    }
}

#[cfg(test)]
mod tests {
    use ringback_core::domain::lead::{DepositStatus, SchedulingPreferences, SOURCE_SMS, SOURCE_VOICE};
    use ringback_core::domain::OrgId;

    use crate::repositories::{
        InMemoryLeadRepository, InMemoryProcessedEventStore, LeadRepository, ProcessedEventStore,
    };

    #[tokio::test]
    async fn in_memory_leads_share_identity_across_channels() {
        let repo = InMemoryLeadRepository::default();
        let org = OrgId::from("org-1");

        let first = repo.get_or_create_by_phone(&org, "+15550001111", SOURCE_SMS, "SMS Lead").await.expect("lead");
        let second = repo.get_or_create_by_phone(&org, "555-000-1111", SOURCE_VOICE, "Caller").await.expect("lead");
        assert_eq!(first.id, second.id);

        repo.update_scheduling_preferences(
            &first.id,
            SchedulingPreferences { notes: Some("prefers text".to_string()), ..SchedulingPreferences::default() },
        )
        .await
        .expect("prefs");
        repo.update_deposit_status(&first.id, DepositStatus::Requested, None).await.expect("deposit");

        let stored = repo.find_by_id(&org, &first.id).await.expect("find").expect("lead");
        assert_eq!(stored.preferences.notes.as_deref(), Some("prefers text"));
        assert_eq!(stored.deposit_status, DepositStatus::Requested);
        assert!(repo.find_by_id(&OrgId::from("org-2"), &first.id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn in_memory_processed_store_dedups() {
        let store = InMemoryProcessedEventStore::default();
        assert!(store.mark_processed("telnyx", "evt-1").await.expect("mark"));
        assert!(!store.mark_processed("telnyx", "evt-1").await.expect("mark"));
        assert!(store.already_processed("telnyx", "evt-1").await.expect("check"));
    }
}
