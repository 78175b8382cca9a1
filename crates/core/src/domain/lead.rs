use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::OrgId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadId(pub String);

/// Channel that first produced a lead.
pub const SOURCE_SMS: &str = "telnyx_sms";
pub const SOURCE_VOICE: &str = "voice";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingPreferences {
    pub service_interest: Option<String>,
    pub patient_type: Option<String>,
    pub preferred_days: Option<String>,
    pub preferred_times: Option<String>,
    pub notes: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    None,
    Requested,
    Paid,
    Refunded,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Requested => "requested",
            Self::Paid => "paid",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "requested" | "pending" => Some(Self::Requested),
            "paid" => Some(Self::Paid),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub org_id: OrgId,
    pub name: String,
    pub email: Option<String>,
    /// Canonical digit form, see [`crate::phone::normalize_e164_digits`].
    pub phone: String,
    pub source: String,
    pub message: Option<String>,
    pub preferences: SchedulingPreferences,
    pub deposit_status: DepositStatus,
    pub priority_level: Option<String>,
    pub created_at: DateTime<Utc>,
}
