use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use ringback_core::domain::conversation::{ConversationResponse, MessageRequest, StartRequest};
use ringback_core::domain::job::JobRequest;

use crate::processor::{ConversationProcessor, ProcessorError};

/// Canned processor. Replies are `"<prefix><patient text>"` unless a fixed
/// reply or a failure is configured. Every request is recorded in arrival
/// order.
#[derive(Default)]
pub struct ScriptedProcessor {
    fixed_reply: Option<String>,
    failure: Option<ProcessorError>,
    requests: Mutex<Vec<JobRequest>>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replying(reply: impl Into<String>) -> Self {
        Self { fixed_reply: Some(reply.into()), ..Self::default() }
    }

    pub fn failing(error: ProcessorError) -> Self {
        Self { failure: Some(error), ..Self::default() }
    }

    pub async fn requests(&self) -> Vec<JobRequest> {
        self.requests.lock().await.clone()
    }

    async fn respond(
        &self,
        request: JobRequest,
        patient_text: &str,
    ) -> Result<ConversationResponse, ProcessorError> {
        let conversation_id = request.conversation_id().to_string();
        self.requests.lock().await.push(request);

        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let message = match &self.fixed_reply {
            Some(reply) => reply.clone(),
            None => format!("Thanks! You said: {patient_text}"),
        };
        Ok(ConversationResponse { conversation_id, message, timestamp: Utc::now() })
    }
}

#[async_trait]
impl ConversationProcessor for ScriptedProcessor {
    async fn start_conversation(
        &self,
        request: StartRequest,
    ) -> Result<ConversationResponse, ProcessorError> {
        let intro = request.intro.clone();
        self.respond(JobRequest::Start(request), &intro).await
    }

    async fn process_message(
        &self,
        request: MessageRequest,
    ) -> Result<ConversationResponse, ProcessorError> {
        let text = request.message.clone();
        self.respond(JobRequest::Message(request), &text).await
    }
}
