use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use ringback_agent::{ConversationProcessor, ReplyDecision, ReplyGuard};
use ringback_core::compliance::MessagePurpose;
use ringback_core::config::ConversationConfig;
use ringback_core::domain::conversation::{Channel, ConversationResponse};
use ringback_core::domain::job::{JobRequest, QueuedJob};
use ringback_core::domain::OrgId;
use ringback_db::repositories::ConversationJobRepository;

use crate::outbound::{OutboundMessage, OutboundMessenger};
use crate::queue::ConversationQueue;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub poll_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { workers: 2, batch_size: 5, poll_wait: Duration::from_millis(2_000) }
    }
}

impl From<&ConversationConfig> for WorkerConfig {
    fn from(config: &ConversationConfig) -> Self {
        Self {
            workers: config.worker_count.max(1),
            batch_size: config.batch_size.max(1),
            poll_wait: Duration::from_millis(config.poll_wait_ms),
        }
    }
}

/// N workers sharing one queue. Each worker pulls a batch, runs every job
/// through the processor and texts SMS replies back to the patient.
#[derive(Clone)]
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<dyn ConversationQueue>,
    processor: Arc<dyn ConversationProcessor>,
    jobs: Arc<dyn ConversationJobRepository>,
    messenger: OutboundMessenger,
    guard: ReplyGuard,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn ConversationQueue>,
        processor: Arc<dyn ConversationProcessor>,
        jobs: Arc<dyn ConversationJobRepository>,
        messenger: OutboundMessenger,
    ) -> Self {
        Self { config, queue, processor, jobs, messenger, guard: ReplyGuard::default() }
    }

    /// Resolves once every worker has observed shutdown and finished its
    /// in-flight batch.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers.max(1) {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.work(worker_id, shutdown).await });
        }
        info!(
            event_name = "conversation.workers.started",
            workers = self.config.workers.max(1),
            "conversation workers started"
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(join_error) = joined {
                error!(
                    event_name = "conversation.worker.panicked",
                    error = %join_error,
                    "conversation worker exited abnormally"
                );
            }
        }
        info!(event_name = "conversation.workers.stopped", "conversation workers stopped");
    }

    async fn work(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = self.queue.receive(self.config.batch_size, self.config.poll_wait) => received,
            };

            let batch = match received {
                Ok(batch) => batch,
                Err(error) => {
                    warn!(
                        event_name = "conversation.worker.queue_closed",
                        worker_id,
                        error = %error,
                        "conversation queue closed, worker exiting"
                    );
                    break;
                }
            };

            for job in batch {
                self.process(worker_id, job).await;
            }
        }
        debug!(event_name = "conversation.worker.exited", worker_id, "conversation worker exited");
    }

    pub async fn process(&self, worker_id: usize, job: QueuedJob) {
        let result = match &job.request {
            JobRequest::Start(request) => self.processor.start_conversation(request.clone()).await,
            JobRequest::Message(request) => self.processor.process_message(request.clone()).await,
        };

        match result {
            Ok(response) => {
                self.reply(&job, &response).await;
                if job.track_status {
                    if let Err(error) = self.jobs.mark_completed(&job.id, response).await {
                        error!(
                            event_name = "conversation.job.persist_failed",
                            job_id = %job.id.0,
                            error = %error,
                            "failed to mark conversation job completed"
                        );
                    }
                }
                info!(
                    event_name = "conversation.job.completed",
                    worker_id,
                    job_id = %job.id.0,
                    kind = job.request.kind(),
                    conversation_id = job.request.conversation_id(),
                    "conversation job completed"
                );
            }
            Err(processor_error) => {
                warn!(
                    event_name = "conversation.job.failed",
                    worker_id,
                    job_id = %job.id.0,
                    conversation_id = job.request.conversation_id(),
                    error = %processor_error,
                    "conversation job failed"
                );
                if job.track_status {
                    if let Err(error) =
                        self.jobs.mark_failed(&job.id, &processor_error.to_string()).await
                    {
                        error!(
                            event_name = "conversation.job.persist_failed",
                            job_id = %job.id.0,
                            error = %error,
                            "failed to mark conversation job failed"
                        );
                    }
                }
            }
        }
    }

    /// Voice turns are answered in-call and silent starts only open the
    /// thread, so only non-silent SMS jobs produce a text.
    async fn reply(&self, job: &QueuedJob, response: &ConversationResponse) {
        let (org_id, clinic_number, patient_number) = match &job.request {
            JobRequest::Message(request) if request.channel == Channel::Sms => {
                (&request.org_id, &request.to, &request.from)
            }
            JobRequest::Start(request) if request.channel == Channel::Sms && !request.silent => {
                (&request.org_id, &request.to, &request.from)
            }
            _ => return,
        };

        let text = match self.guard.evaluate(&response.message) {
            ReplyDecision::Send { text, redacted } => {
                if redacted {
                    warn!(
                        event_name = "conversation.reply.redacted",
                        job_id = %job.id.0,
                        "card number removed from AI reply"
                    );
                }
                text
            }
            ReplyDecision::Suppress { reason_code } => {
                warn!(
                    event_name = "conversation.reply.suppressed",
                    job_id = %job.id.0,
                    reason_code,
                    "AI reply withheld"
                );
                return;
            }
        };

        let org_id = OrgId(org_id.clone());
        let delivery = self
            .messenger
            .deliver(OutboundMessage {
                org_id: &org_id,
                from: clinic_number,
                to: patient_number,
                body: &text,
                purpose: MessagePurpose::Transactional,
                template_name: None,
                correlation_id: Some(&job.id.0),
            })
            .await;
        if let Err(error) = delivery {
            error!(
                event_name = "conversation.reply.failed",
                job_id = %job.id.0,
                org_id = %org_id,
                error = %error,
                "failed to deliver AI reply"
            );
        }
    }
}
