//! Number and 10DLC registration records. Only their persistence is modelled
//! here; the provisioning workflow itself lives with the provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::OrgId;

pub const HOSTED_STATUS_ACTIVATED: &str = "activated";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedNumberOrder {
    pub provider_order_id: String,
    pub org_id: OrgId,
    /// Canonical digit form.
    pub phone_number: String,
    pub status: String,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandRecord {
    pub brand_id: String,
    pub org_id: OrgId,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub campaign_id: String,
    pub brand_id: String,
    pub org_id: OrgId,
    pub use_case: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}
