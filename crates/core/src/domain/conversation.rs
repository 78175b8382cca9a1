//! Requests and responses exchanged with the AI conversation engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Voice,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Voice => "voice",
        }
    }
}

/// `sms:<org>:<digits>`; one thread per patient phone per tenant.
pub fn sms_conversation_id(org_id: &str, phone_digits: &str) -> String {
    format!("sms:{org_id}:{phone_digits}")
}

pub fn voice_conversation_id(org_id: &str, phone_digits: &str) -> String {
    format!("voice:{org_id}:{phone_digits}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub org_id: String,
    pub lead_id: String,
    pub conversation_id: String,
    pub channel: Channel,
    pub from: String,
    pub to: String,
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub org_id: String,
    pub lead_id: String,
    pub conversation_id: String,
    pub channel: Channel,
    pub from: String,
    pub to: String,
    pub intro: String,
    pub source: String,
    /// The opening reply was already delivered out of band; do not send
    /// the engine's first turn.
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
