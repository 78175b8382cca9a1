//! In-process transport between the publisher and the worker pool.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use ringback_core::domain::job::QueuedJob;

pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("conversation queue is closed")]
    Closed,
}

#[async_trait]
pub trait ConversationQueue: Send + Sync {
    /// Waits for capacity; callers bound this with their own timeout.
    async fn send(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Waits up to `wait` for the first job, then drains whatever else is
    /// already queued, up to `max` jobs in total. An empty batch means the
    /// wait elapsed.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueuedJob>, QueueError>;
}

pub struct MemoryQueue {
    sender: mpsc::Sender<QueuedJob>,
    receiver: Mutex<mpsc::Receiver<QueuedJob>>,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self { sender, receiver: Mutex::new(receiver) }
    }

    /// Jobs sent but not yet received.
    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl ConversationQueue for MemoryQueue {
    async fn send(&self, job: QueuedJob) -> Result<(), QueueError> {
        self.sender.send(job).await.map_err(|_| QueueError::Closed)
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueuedJob>, QueueError> {
        let mut receiver = self.receiver.lock().await;
        let first = match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => return Err(QueueError::Closed),
            Err(_) => return Ok(Vec::new()),
        };

        let mut batch = vec![first];
        while batch.len() < max.max(1) {
            match receiver.try_recv() {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }
        Ok(batch)
    }
}
