use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use ringback_core::domain::conversation::{ConversationResponse, MessageRequest, StartRequest};

use crate::processor::{ConversationProcessor, ProcessorError};

const START_PATH: &str = "conversations/start";
const MESSAGE_PATH: &str = "conversations/message";

/// JSON client for an external conversation service.
///
/// `POST {base}/conversations/start` and `POST {base}/conversations/message`
/// receive the request structs as-is and answer with
/// `{conversation_id?, message | response, timestamp?}`.
#[derive(Clone)]
pub struct HttpConversationProcessor {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default, alias = "response")]
    message: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl HttpConversationProcessor {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self::with_client(Client::new(), base_url, timeout_secs)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
        conversation_id: &str,
    ) -> Result<ConversationResponse, ProcessorError> {
        let url = self.endpoint(path);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ProcessorError::Timeout(self.timeout.as_secs())
                } else {
                    ProcessorError::Transport(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "conversation.processor.rejected",
                status = status.as_u16(),
                conversation_id,
                "conversation service returned an error status"
            );
            return Err(ProcessorError::Status { status: status.as_u16(), body });
        }

        let reply: ServiceReply =
            response.json().await.map_err(|error| ProcessorError::Decode(error.to_string()))?;

        Ok(ConversationResponse {
            conversation_id: reply
                .conversation_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| conversation_id.to_string()),
            message: reply.message.unwrap_or_default(),
            timestamp: reply.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl ConversationProcessor for HttpConversationProcessor {
    async fn start_conversation(
        &self,
        request: StartRequest,
    ) -> Result<ConversationResponse, ProcessorError> {
        self.post(START_PATH, &request, &request.conversation_id).await
    }

    async fn process_message(
        &self,
        request: MessageRequest,
    ) -> Result<ConversationResponse, ProcessorError> {
        self.post(MESSAGE_PATH, &request, &request.conversation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpConversationProcessor, ServiceReply};

    #[test]
    fn endpoint_joins_without_double_slash() {
        let processor = HttpConversationProcessor::new("http://localhost:9000/api/", 8);
        assert_eq!(
            processor.endpoint("conversations/start"),
            "http://localhost:9000/api/conversations/start"
        );
    }

    #[test]
    fn reply_accepts_response_alias() {
        let reply: ServiceReply =
            serde_json::from_str(r#"{"response":"Hi there"}"#).expect("decode");
        assert_eq!(reply.message.as_deref(), Some("Hi there"));
        assert!(reply.conversation_id.is_none());
    }
}
