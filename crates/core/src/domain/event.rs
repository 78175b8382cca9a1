//! Canonical events written to the append-only log and outbox in the same
//! transaction as the state change they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROVIDER_TELNYX: &str = "telnyx";

/// Stream that all of a tenant's messaging events are appended to.
pub fn clinic_stream(org_id: &str) -> String {
    format!("clinic:{org_id}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceivedV1 {
    pub message_id: String,
    pub clinic_id: String,
    pub from_e164: String,
    pub to_e164: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    pub provider: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_event_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSentV1 {
    pub message_id: String,
    pub clinic_id: String,
    pub from_e164: String,
    pub to_e164: String,
    pub body: String,
    pub provider: String,
    pub sent_at: DateTime<Utc>,
    pub quiet_hours_suppressed: bool,
    pub opt_out_suppressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedOrderActivatedV1 {
    pub order_id: String,
    pub clinic_id: String,
    pub e164_number: String,
    pub activated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandCreatedV1 {
    pub clinic_id: String,
    pub brand_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignApprovedV1 {
    pub clinic_id: String,
    pub brand_id: String,
    pub campaign_id: String,
    pub use_case: String,
    pub approved_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentChangedV1 {
    pub clinic_id: String,
    pub recipient_e164: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalEvent {
    MessageReceived(MessageReceivedV1),
    MessageSent(MessageSentV1),
    HostedOrderActivated(HostedOrderActivatedV1),
    BrandCreated(BrandCreatedV1),
    CampaignApproved(CampaignApprovedV1),
    OptOutRecorded(ConsentChangedV1),
    OptInRecorded(ConsentChangedV1),
}

impl CanonicalEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageReceived(_) => "messaging.message.received.v1",
            Self::MessageSent(_) => "messaging.message.sent.v1",
            Self::HostedOrderActivated(_) => "messaging.hosted_order.activated.v1",
            Self::BrandCreated(_) => "messaging.ten_dlc.brand.created.v1",
            Self::CampaignApproved(_) => "messaging.ten_dlc.campaign.approved.v1",
            Self::OptOutRecorded(_) => "messaging.consent.opt_out.v1",
            Self::OptInRecorded(_) => "messaging.consent.opt_in.v1",
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Row shape handed to outbox consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub aggregate: String,
    /// Microseconds since the unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{clinic_stream, CanonicalEvent, ConsentChangedV1, MessageReceivedV1};

    #[test]
    fn received_event_payload_uses_wire_names() {
        let event = CanonicalEvent::MessageReceived(MessageReceivedV1 {
            message_id: "m-1".to_string(),
            clinic_id: "org-1".to_string(),
            from_e164: "+15550001111".to_string(),
            to_e164: "+15559998888".to_string(),
            body: "Need info".to_string(),
            media_urls: Vec::new(),
            provider: "telnyx".to_string(),
            received_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            provider_event_id: Some("evt-1".to_string()),
        });

        let payload = event.payload().expect("payload");
        assert_eq!(event.event_type(), "messaging.message.received.v1");
        assert_eq!(payload["from_e164"], "+15550001111");
        assert_eq!(payload["provider_event_id"], "evt-1");
        assert!(payload.get("media_urls").is_none());
        assert_eq!(clinic_stream("org-1"), "clinic:org-1");
    }

    #[test]
    fn consent_events_share_a_payload_but_not_a_type() {
        let consent = ConsentChangedV1 {
            clinic_id: "org-1".to_string(),
            recipient_e164: "+15550001111".to_string(),
            reason: "STOP".to_string(),
            recorded_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        };
        assert_ne!(
            CanonicalEvent::OptOutRecorded(consent.clone()).event_type(),
            CanonicalEvent::OptInRecorded(consent).event_type()
        );
    }
}
