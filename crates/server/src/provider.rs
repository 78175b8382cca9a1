//! Outbound SMS transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use ringback_core::config::ProviderConfig;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutboundRequest {
    pub from: String,
    pub to: String,
    #[serde(rename = "text")]
    pub body: String,
    #[serde(rename = "media_urls", skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(rename = "messaging_profile_id", skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub status: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("provider send timed out after {0}s")]
    Timeout(u64),
    #[error("provider rejected send with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<SendReceipt, SendError>;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    data: SendResponseData,
}

#[derive(Debug, Deserialize)]
struct SendResponseData {
    id: String,
    #[serde(default)]
    to: Vec<SendResponseRecipient>,
}

#[derive(Debug, Deserialize)]
struct SendResponseRecipient {
    #[serde(default)]
    status: Option<String>,
}

/// `POST {base_url}/messages` with bearer auth.
pub struct ProviderMessageSender {
    client: Client,
    base_url: String,
    api_key: SecretString,
    timeout: Duration,
}

impl ProviderMessageSender {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.send_timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl MessageSender for ProviderMessageSender {
    async fn send(&self, request: OutboundRequest) -> Result<SendReceipt, SendError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    SendError::Timeout(self.timeout.as_secs())
                } else {
                    SendError::Transport(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected { status: status.as_u16(), body });
        }

        let decoded: SendResponse =
            response.json().await.map_err(|error| SendError::Decode(error.to_string()))?;
        let status = decoded
            .data
            .to
            .into_iter()
            .find_map(|recipient| recipient.status)
            .unwrap_or_else(|| "queued".to_string());
        Ok(SendReceipt { provider_message_id: decoded.data.id, status })
    }
}

/// Test double that records every request. While `failing` is set, sends
/// are recorded and then rejected.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundRequest>>,
    failing: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sender = Self::default();
        sender.set_failing(true);
        sender
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().await.clone()
    }

    pub async fn bodies(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|request| request.body.clone()).collect()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, request: OutboundRequest) -> Result<SendReceipt, SendError> {
        self.sent.lock().await.push(request);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SendError::Transport("recording sender set to fail".to_string()));
        }
        Ok(SendReceipt {
            provider_message_id: format!("out-{}", Uuid::new_v4()),
            status: "queued".to_string(),
        })
    }
}
