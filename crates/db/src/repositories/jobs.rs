use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use ringback_core::domain::conversation::ConversationResponse;
use ringback_core::domain::job::{ConversationJob, JobId, JobRequest, JobStatus};

use super::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, ConversationJobRepository,
    RepositoryError,
};
use crate::DbPool;

#[derive(Clone)]
pub struct SqlConversationJobRepository {
    pool: DbPool,
}

impl SqlConversationJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn finish(
        &self,
        id: &JobId,
        status: JobStatus,
        response_json: Option<String>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = format_timestamp(Utc::now());
        sqlx::query(
            "UPDATE conversation_jobs SET
                status = ?,
                response_json = ?,
                error_message = ?,
                updated_at = ?,
                completed_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(response_json)
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationJobRepository for SqlConversationJobRepository {
    async fn put_pending(&self, job: ConversationJob) -> Result<bool, RepositoryError> {
        let request_json = serde_json::to_string(&job.request)
            .map_err(|error| RepositoryError::Decode(format!("job request encode: {error}")))?;

        let result = sqlx::query(
            "INSERT INTO conversation_jobs (
                id,
                conversation_id,
                request_kind,
                request_json,
                status,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&job.id.0)
        .bind(&job.conversation_id)
        .bind(job.request.kind())
        .bind(request_json)
        .bind(JobStatus::Pending.as_str())
        .bind(format_timestamp(job.created_at))
        .bind(format_timestamp(job.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(
        &self,
        id: &JobId,
        response: ConversationResponse,
    ) -> Result<(), RepositoryError> {
        let response_json = serde_json::to_string(&response)
            .map_err(|error| RepositoryError::Decode(format!("job response encode: {error}")))?;
        self.finish(id, JobStatus::Completed, Some(response_json), None).await
    }

    async fn mark_failed(&self, id: &JobId, error: &str) -> Result<(), RepositoryError> {
        self.finish(id, JobStatus::Failed, None, Some(error)).await
    }

    async fn release_pending(&self, id: &JobId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM conversation_jobs WHERE id = ? AND status = ?")
            .bind(&id.0)
            .bind(JobStatus::Pending.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<ConversationJob>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                conversation_id,
                request_json,
                status,
                response_json,
                error_message,
                created_at,
                updated_at,
                completed_at
             FROM conversation_jobs
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(job_from_row).transpose()
    }
}

fn job_from_row(row: SqliteRow) -> Result<ConversationJob, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job status `{status_raw}`")))?;

    let request_json = row.try_get::<String, _>("request_json")?;
    let request: JobRequest = serde_json::from_str(&request_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid request_json: {error}")))?;

    let response = row
        .try_get::<Option<String>, _>("response_json")?
        .map(|raw| serde_json::from_str::<ConversationResponse>(&raw))
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("invalid response_json: {error}")))?;

    Ok(ConversationJob {
        id: JobId(row.try_get("id")?),
        status,
        conversation_id: row.try_get("conversation_id")?,
        request,
        response,
        error: row.try_get("error_message")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use ringback_core::domain::conversation::{Channel, ConversationResponse, MessageRequest};
    use ringback_core::domain::job::{ConversationJob, JobId, JobRequest, JobStatus};

    use super::SqlConversationJobRepository;
    use crate::repositories::ConversationJobRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn message_job(id: &str) -> ConversationJob {
        ConversationJob::pending(
            JobId(id.to_string()),
            JobRequest::Message(MessageRequest {
                org_id: "org-1".to_string(),
                lead_id: "lead-1".to_string(),
                conversation_id: "sms:org-1:15550001111".to_string(),
                channel: Channel::Sms,
                from: "+15550001111".to_string(),
                to: "+15559998888".to_string(),
                message: "Need info".to_string(),
                metadata: BTreeMap::new(),
            }),
            Utc.with_ymd_and_hms(2026, 2, 23, 12, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn pending_job_is_recorded_once_and_completes() {
        let pool = setup_pool().await;
        let repo = SqlConversationJobRepository::new(pool.clone());
        let id = JobId("telnyx:msg-1".to_string());

        assert!(repo.put_pending(message_job(&id.0)).await.expect("put"));
        assert!(!repo.put_pending(message_job(&id.0)).await.expect("put again"));

        let pending = repo.find_by_id(&id).await.expect("find").expect("job");
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.conversation_id, "sms:org-1:15550001111");
        assert_eq!(pending, message_job(&id.0));

        let response = ConversationResponse {
            conversation_id: "sms:org-1:15550001111".to_string(),
            message: "Happy to help!".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 2, 23, 12, 0, 5).unwrap(),
        };
        repo.mark_completed(&id, response.clone()).await.expect("complete");

        let done = repo.find_by_id(&id).await.expect("find").expect("job");
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.response, Some(response));
        assert!(done.completed_at.is_some());
        pool.close().await;
    }

    #[tokio::test]
    async fn failed_job_keeps_error_and_missing_job_is_none() {
        let pool = setup_pool().await;
        let repo = SqlConversationJobRepository::new(pool.clone());
        let id = JobId("voice:call-1".to_string());

        repo.put_pending(message_job(&id.0)).await.expect("put");
        repo.mark_failed(&id, "processor timed out").await.expect("fail");

        let failed = repo.find_by_id(&id).await.expect("find").expect("job");
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("processor timed out"));
        assert!(failed.response.is_none());

        assert!(repo.find_by_id(&JobId("nope".to_string())).await.expect("find").is_none());
        pool.close().await;
    }

    #[tokio::test]
    async fn released_job_can_be_recorded_again_but_finished_jobs_stay() {
        let pool = setup_pool().await;
        let repo = SqlConversationJobRepository::new(pool.clone());
        let id = JobId("voice:call-2".to_string());

        assert!(repo.put_pending(message_job(&id.0)).await.expect("put"));
        repo.release_pending(&id).await.expect("release");
        assert!(repo.find_by_id(&id).await.expect("find").is_none());
        assert!(repo.put_pending(message_job(&id.0)).await.expect("put again"));

        repo.mark_failed(&id, "processor timed out").await.expect("fail");
        repo.release_pending(&id).await.expect("release");
        let kept = repo.find_by_id(&id).await.expect("find").expect("job");
        assert_eq!(kept.status, JobStatus::Failed);
        pool.close().await;
    }
}
