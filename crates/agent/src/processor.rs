use async_trait::async_trait;
use thiserror::Error;

use ringback_core::domain::conversation::{ConversationResponse, MessageRequest, StartRequest};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("conversation service unreachable: {0}")]
    Transport(String),
    #[error("conversation service timed out after {0}s")]
    Timeout(u64),
    #[error("conversation service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("conversation service response could not be decoded: {0}")]
    Decode(String),
    #[error("conversation rejected: {0}")]
    Rejected(String),
}

/// The AI side of a conversation. Implementations are expected to be
/// idempotent per job: a redelivered start for the same conversation id must
/// not open a second thread.
#[async_trait]
pub trait ConversationProcessor: Send + Sync {
    async fn start_conversation(
        &self,
        request: StartRequest,
    ) -> Result<ConversationResponse, ProcessorError>;

    async fn process_message(
        &self,
        request: MessageRequest,
    ) -> Result<ConversationResponse, ProcessorError>;
}
