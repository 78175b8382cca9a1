//! Provider webhook envelopes.
//!
//! The provider posts either a wrapped `{"data": {id, event_type, occurred_at,
//! payload}}` document or a bare message record whose event type has to be
//! inferred from `record_type` and `direction`. Both shapes are parsed into a
//! single [`ProviderEvent`] here so nothing downstream depends on the shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::message::is_failure_receipt;
use crate::phone::normalize_value;

pub const EVENT_MESSAGE_RECEIVED: &str = "message.received";
pub const EVENT_DELIVERY_STATUS: &str = "message.delivery_status";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("webhook body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("webhook envelope is missing an event id")]
    MissingId,
    #[error("webhook envelope is missing an event type")]
    MissingEventType,
    #[error("webhook payload field `{0}` is missing or empty")]
    MissingField(&'static str),
    #[error("webhook payload is malformed: {0}")]
    InvalidPayload(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageReceived,
    DeliveryStatus,
    HostedOrder,
    Call,
    Unknown,
}

impl EventKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            EVENT_MESSAGE_RECEIVED => Self::MessageReceived,
            EVENT_DELIVERY_STATUS | "message.sent" | "message.finalized" => Self::DeliveryStatus,
            other if other.starts_with("number_order.") || other.starts_with("hosted_messaging.") => {
                Self::HostedOrder
            }
            other if other.starts_with("call.") => Self::Call,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    pub kind: EventKind,
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct WrappedEnvelope {
    data: Option<WrappedEvent>,
    #[serde(flatten)]
    top_level: WrappedEvent,
}

#[derive(Debug, Default, Deserialize)]
struct WrappedEvent {
    id: Option<String>,
    event_type: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct BareRecord {
    id: Option<String>,
    record_type: Option<String>,
    received_at: Option<DateTime<Utc>>,
    direction: Option<String>,
}

pub fn parse_envelope(body: &[u8]) -> Result<ProviderEvent, EnvelopeError> {
    let document: Value =
        serde_json::from_slice(body).map_err(|err| EnvelopeError::InvalidJson(err.to_string()))?;
    if !document.is_object() {
        return Err(EnvelopeError::InvalidPayload("expected a JSON object".to_string()));
    }

    let wrapped: WrappedEnvelope = serde_json::from_value(document.clone())
        .map_err(|err| EnvelopeError::InvalidPayload(err.to_string()))?;
    let event = wrapped
        .data
        .filter(|data| data.event_type.is_some())
        .or_else(|| wrapped.top_level.event_type.is_some().then_some(wrapped.top_level));

    if let Some(event) = event {
        let id = non_empty(event.id).ok_or(EnvelopeError::MissingId)?;
        let event_type = non_empty(event.event_type).ok_or(EnvelopeError::MissingEventType)?;
        return Ok(ProviderEvent {
            kind: EventKind::from_event_type(&event_type),
            id,
            event_type,
            occurred_at: event.occurred_at,
            payload: event.payload,
        });
    }

    let record: BareRecord = serde_json::from_value(document.clone())
        .map_err(|err| EnvelopeError::InvalidPayload(err.to_string()))?;
    let id = non_empty(record.id).ok_or(EnvelopeError::MissingId)?;
    let record_type = non_empty(record.record_type).ok_or(EnvelopeError::MissingEventType)?;
    let event_type = if record_type == "message" {
        let inbound = record
            .direction
            .as_deref()
            .map(|direction| direction.eq_ignore_ascii_case("inbound"))
            .unwrap_or(false);
        (if inbound { EVENT_MESSAGE_RECEIVED } else { EVENT_DELIVERY_STATUS }).to_string()
    } else {
        record_type
    };

    Ok(ProviderEvent {
        kind: EventKind::from_event_type(&event_type),
        id,
        event_type,
        occurred_at: record.received_at,
        payload: document,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn text(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).map(str::trim).unwrap_or_default().to_string()
}

fn first_text(value: &Value, keys: &[&str]) -> String {
    keys.iter().map(|key| text(value, key)).find(|found| !found.is_empty()).unwrap_or_default()
}

fn phone_field(value: &Value, nested: &str, flat: &str) -> String {
    let digits = value.get(nested).map(normalize_value).unwrap_or_default();
    if digits.is_empty() {
        return value.get(flat).map(normalize_value).unwrap_or_default();
    }
    digits
}

/// An inbound SMS/MMS. Phone fields are already in canonical digit form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub provider_message_id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub media_urls: Vec<String>,
    pub status: String,
}

impl InboundMessage {
    pub fn from_payload(payload: &Value) -> Result<Self, EnvelopeError> {
        let provider_message_id = first_text(payload, &["id", "message_id"]);
        if provider_message_id.is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        let from = phone_field(payload, "from", "from_number");
        if from.is_empty() {
            return Err(EnvelopeError::MissingField("from"));
        }
        let to = phone_field(payload, "to", "to_number");
        if to.is_empty() {
            return Err(EnvelopeError::MissingField("to"));
        }

        let mut media_urls: Vec<String> = payload
            .get("media_urls")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(media) = payload.get("media").and_then(Value::as_array) {
            media_urls.extend(media.iter().map(|item| text(item, "url")).filter(|url| !url.is_empty()));
        }

        Ok(Self {
            provider_message_id,
            from,
            to,
            text: payload.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
            media_urls,
            status: first_text(payload, &["status"]),
        })
    }
}

/// Delivery receipt for a message we sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub provider_message_id: String,
    pub status: String,
}

impl DeliveryUpdate {
    pub fn from_payload(payload: &Value) -> Result<Self, EnvelopeError> {
        let provider_message_id = first_text(payload, &["id", "message_id"]);
        if provider_message_id.is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        let mut status = text(payload, "status");
        if status.is_empty() {
            status = payload
                .get("to")
                .and_then(Value::as_array)
                .and_then(|recipients| recipients.first())
                .map(|recipient| text(recipient, "status"))
                .unwrap_or_default();
        }
        if status.is_empty() {
            return Err(EnvelopeError::MissingField("status"));
        }
        Ok(Self { provider_message_id, status: status.to_ascii_lowercase() })
    }

    pub fn is_delivered(&self) -> bool {
        self.status == "delivered"
    }

    pub fn is_failed(&self) -> bool {
        is_failure_receipt(&self.status)
    }
}

/// Hosted-number order lifecycle notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostedOrderUpdate {
    pub order_id: String,
    pub org_id: String,
    pub phone_number: String,
    pub status: String,
    pub last_error: Option<String>,
}

impl HostedOrderUpdate {
    pub fn from_payload(payload: &Value) -> Result<Self, EnvelopeError> {
        let order_id = first_text(payload, &["id", "order_id"]);
        if order_id.is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        let org_id = first_text(payload, &["clinic_id", "org_id"]);
        if org_id.is_empty() {
            return Err(EnvelopeError::MissingField("clinic_id"));
        }
        let phone_number = payload.get("phone_number").map(normalize_value).unwrap_or_default();
        if phone_number.is_empty() {
            return Err(EnvelopeError::MissingField("phone_number"));
        }
        let status = text(payload, "status").to_ascii_lowercase();
        if status.is_empty() {
            return Err(EnvelopeError::MissingField("status"));
        }
        let last_error = Some(text(payload, "last_error")).filter(|error| !error.is_empty());
        Ok(Self { order_id, org_id, phone_number, status, last_error })
    }

    pub fn is_activated(&self) -> bool {
        self.status == "activated"
    }
}

const MISSED_CALL_STATUSES: &[&str] = &[
    "no-answer",
    "busy",
    "failed",
    "canceled",
    "cancelled",
    "user-busy",
    "timeout",
    "originator-cancel",
];

/// A call lifecycle notification from the voice side of the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallEvent {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub status: String,
}

impl CallEvent {
    pub fn from_payload(payload: &Value) -> Result<Self, EnvelopeError> {
        let call_id =
            first_text(payload, &["call_control_id", "call_session_id", "call_sid", "id"]);
        if call_id.is_empty() {
            return Err(EnvelopeError::MissingField("call_control_id"));
        }
        let from = phone_field(payload, "from", "caller_number");
        if from.is_empty() {
            return Err(EnvelopeError::MissingField("from"));
        }
        let to = phone_field(payload, "to", "called_number");
        if to.is_empty() {
            return Err(EnvelopeError::MissingField("to"));
        }
        let status = first_text(payload, &["call_status", "status", "hangup_cause", "state"])
            .to_ascii_lowercase()
            .replace('_', "-");
        Ok(Self { call_id, from, to, status })
    }

    pub fn is_missed(&self) -> bool {
        MISSED_CALL_STATUSES.contains(&self.status.as_str())
    }
}
