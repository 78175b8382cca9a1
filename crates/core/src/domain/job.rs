use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::{ConversationResponse, MessageRequest, StartRequest};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The unit of work carried on the conversation queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "request", rename_all = "snake_case")]
pub enum JobRequest {
    Start(StartRequest),
    Message(MessageRequest),
}

impl JobRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Message(_) => "message",
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Start(request) => &request.conversation_id,
            Self::Message(request) => &request.conversation_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub request: JobRequest,
    pub track_status: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationJob {
    pub id: JobId,
    pub status: JobStatus,
    pub conversation_id: String,
    pub request: JobRequest,
    pub response: Option<ConversationResponse>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversationJob {
    pub fn pending(id: JobId, request: JobRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            conversation_id: request.conversation_id().to_string(),
            request,
            response: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
