pub mod conversation;
pub mod event;
pub mod job;
pub mod lead;
pub mod message;
pub mod provisioning;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tenant identifier. Every lead, message and event is scoped to one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgId(pub String);

impl OrgId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrgId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
