use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use ringback_core::domain::conversation::{MessageRequest, StartRequest};
use ringback_core::domain::job::{ConversationJob, JobId, JobRequest, QueuedJob};
use ringback_db::repositories::{ConversationJobRepository, RepositoryError};

use crate::queue::{ConversationQueue, QueueError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub track_status: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { track_status: true }
    }
}

impl EnqueueOptions {
    /// Fire-and-forget work that never gets a job row.
    pub fn without_job_tracking() -> Self {
        Self { track_status: false }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(JobId),
    /// A tracked job with this id already exists; nothing was queued.
    AlreadyQueued(JobId),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to record conversation job: {0}")]
    Repository(#[from] RepositoryError),
    #[error("failed to enqueue conversation job: {0}")]
    Queue(#[from] QueueError),
    #[error("enqueue timed out after {0}s")]
    Timeout(u64),
}

#[derive(Clone)]
pub struct ConversationPublisher {
    queue: Arc<dyn ConversationQueue>,
    jobs: Arc<dyn ConversationJobRepository>,
    timeout: Duration,
}

impl ConversationPublisher {
    pub fn new(
        queue: Arc<dyn ConversationQueue>,
        jobs: Arc<dyn ConversationJobRepository>,
        timeout: Duration,
    ) -> Self {
        Self { queue, jobs, timeout }
    }

    pub async fn enqueue_start(
        &self,
        job_id: &str,
        request: StartRequest,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, PublishError> {
        self.enqueue(job_id, JobRequest::Start(request), options).await
    }

    pub async fn enqueue_message(
        &self,
        job_id: &str,
        request: MessageRequest,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, PublishError> {
        self.enqueue(job_id, JobRequest::Message(request), options).await
    }

    async fn enqueue(
        &self,
        job_id: &str,
        request: JobRequest,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, PublishError> {
        let id = if job_id.trim().is_empty() {
            JobId(Uuid::new_v4().to_string())
        } else {
            JobId(job_id.to_string())
        };

        let deadline = Instant::now() + self.timeout;

        if options.track_status {
            let job = ConversationJob::pending(id.clone(), request.clone(), Utc::now());
            if !self.within(deadline, self.jobs.put_pending(job)).await? {
                debug!(
                    event_name = "conversation.job.already_queued",
                    job_id = %id.0,
                    "conversation job already recorded, not re-queued"
                );
                return Ok(EnqueueOutcome::AlreadyQueued(id));
            }
        }

        let kind = request.kind();
        let job = QueuedJob { id: id.clone(), request, track_status: options.track_status };
        if let Err(publish_error) = self.within(deadline, self.queue.send(job)).await {
            // A row left pending here would make every redelivery look
            // like a duplicate of work that was never queued.
            if options.track_status {
                if let Err(release_error) = self.jobs.release_pending(&id).await {
                    warn!(
                        event_name = "conversation.job.release_failed",
                        job_id = %id.0,
                        error = %release_error,
                        "could not release job row after failed enqueue"
                    );
                }
            }
            return Err(publish_error);
        }

        debug!(
            event_name = "conversation.job.enqueued",
            job_id = %id.0,
            kind,
            track_status = options.track_status,
            "conversation job enqueued"
        );
        Ok(EnqueueOutcome::Queued(id))
    }

    async fn within<T, E>(
        &self,
        deadline: Instant,
        work: impl Future<Output = Result<T, E>>,
    ) -> Result<T, PublishError>
    where
        PublishError: From<E>,
    {
        match tokio::time::timeout_at(deadline, work).await {
            Ok(result) => result.map_err(PublishError::from),
            Err(_) => Err(PublishError::Timeout(self.timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use ringback_core::domain::conversation::{Channel, StartRequest};
    use ringback_core::domain::job::{JobId, JobStatus};
    use ringback_db::repositories::{ConversationJobRepository, InMemoryConversationJobRepository};

    use super::{ConversationPublisher, EnqueueOptions, EnqueueOutcome, PublishError};
    use crate::queue::{ConversationQueue, MemoryQueue};

    fn start_request() -> StartRequest {
        StartRequest {
            org_id: "org-1".to_string(),
            lead_id: "lead-1".to_string(),
            conversation_id: "voice:org-1:15550001111".to_string(),
            channel: Channel::Voice,
            from: "+15550001111".to_string(),
            to: "+15559998888".to_string(),
            intro: "Missed call".to_string(),
            source: "voice".to_string(),
            silent: true,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn tracked_enqueue_is_idempotent_on_job_id() {
        let queue = Arc::new(MemoryQueue::new(8));
        let jobs = Arc::new(InMemoryConversationJobRepository::default());
        let publisher = ConversationPublisher::new(queue.clone(), jobs.clone(), Duration::from_secs(1));

        let first = publisher
            .enqueue_start("voice:call-1", start_request(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        let second = publisher
            .enqueue_start("voice:call-1", start_request(), EnqueueOptions::default())
            .await
            .expect("enqueue");

        assert_eq!(first, EnqueueOutcome::Queued(JobId("voice:call-1".to_string())));
        assert_eq!(second, EnqueueOutcome::AlreadyQueued(JobId("voice:call-1".to_string())));
        assert_eq!(queue.pending(), 1);

        let job = jobs.find_by_id(&JobId("voice:call-1".to_string())).await.expect("find").expect("job");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.conversation_id, "voice:org-1:15550001111");
    }

    #[tokio::test]
    async fn untracked_enqueue_skips_job_row() {
        let queue = Arc::new(MemoryQueue::new(8));
        let jobs = Arc::new(InMemoryConversationJobRepository::default());
        let publisher = ConversationPublisher::new(queue.clone(), jobs.clone(), Duration::from_secs(1));

        let outcome = publisher
            .enqueue_start("", start_request(), EnqueueOptions::without_job_tracking())
            .await
            .expect("enqueue");
        let EnqueueOutcome::Queued(id) = outcome else {
            panic!("expected queued");
        };
        assert!(!id.0.is_empty());
        assert!(jobs.find_by_id(&id).await.expect("find").is_none());

        let batch = queue.receive(1, Duration::from_millis(10)).await.expect("receive");
        assert!(!batch[0].track_status);
    }

    #[tokio::test]
    async fn full_queue_times_out() {
        let queue = Arc::new(MemoryQueue::new(1));
        let jobs = Arc::new(InMemoryConversationJobRepository::default());
        let publisher = ConversationPublisher::new(queue, jobs, Duration::from_millis(20));

        publisher
            .enqueue_start("a", start_request(), EnqueueOptions::without_job_tracking())
            .await
            .expect("first fits");
        let error = publisher
            .enqueue_start("b", start_request(), EnqueueOptions::without_job_tracking())
            .await
            .expect_err("queue full");
        assert!(matches!(error, PublishError::Timeout(_)));
    }

    #[tokio::test]
    async fn job_that_never_reached_the_queue_can_be_published_again() {
        let queue = Arc::new(MemoryQueue::new(1));
        let jobs = Arc::new(InMemoryConversationJobRepository::default());
        let publisher = ConversationPublisher::new(queue.clone(), jobs.clone(), Duration::from_millis(20));
        let id = JobId("voice:call-2".to_string());

        publisher
            .enqueue_start("filler", start_request(), EnqueueOptions::without_job_tracking())
            .await
            .expect("first fits");
        let error = publisher
            .enqueue_start("voice:call-2", start_request(), EnqueueOptions::default())
            .await
            .expect_err("queue full");
        assert!(matches!(error, PublishError::Timeout(_)));
        assert!(jobs.find_by_id(&id).await.expect("find").is_none());

        queue.receive(1, Duration::from_millis(10)).await.expect("drain");
        let retried = publisher
            .enqueue_start("voice:call-2", start_request(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        assert_eq!(retried, EnqueueOutcome::Queued(id.clone()));
        assert_eq!(jobs.find_by_id(&id).await.expect("find").expect("job").status, JobStatus::Pending);
        assert_eq!(queue.pending(), 1);
    }
}
