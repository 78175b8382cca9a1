use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::ComplianceBuildError;

/// Why a message is being sent. Only marketing traffic honours quiet hours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePurpose {
    Marketing,
    Transactional,
    Compliance,
}

impl MessagePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Marketing => "marketing",
            Self::Transactional => "transactional",
            Self::Compliance => "compliance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "marketing" => Some(Self::Marketing),
            "transactional" => Some(Self::Transactional),
            "compliance" => Some(Self::Compliance),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuietHours {
    start_minutes: u32,
    end_minutes: u32,
    timezone: Tz,
}

impl QuietHours {
    pub fn new(start: &str, end: &str, timezone: &str) -> Result<Self, ComplianceBuildError> {
        let timezone = if timezone.trim().is_empty() {
            Tz::UTC
        } else {
            timezone
                .trim()
                .parse::<Tz>()
                .map_err(|_| ComplianceBuildError::Timezone(timezone.to_string()))?
        };
        Ok(Self { start_minutes: parse_clock(start)?, end_minutes: parse_clock(end)?, timezone })
    }

    pub fn is_suppressed(&self, now: DateTime<Utc>, purpose: MessagePurpose) -> bool {
        if purpose != MessagePurpose::Marketing || self.start_minutes == self.end_minutes {
            return false;
        }
        let local = now.with_timezone(&self.timezone);
        let minutes = local.hour() * 60 + local.minute();
        if self.start_minutes < self.end_minutes {
            minutes >= self.start_minutes && minutes < self.end_minutes
        } else {
            minutes >= self.start_minutes || minutes < self.end_minutes
        }
    }
}

pub fn parse_clock(value: &str) -> Result<u32, ComplianceBuildError> {
    let invalid = || ComplianceBuildError::Clock(value.to_string());
    let (hours, minutes) = value.trim().split_once(':').ok_or_else(invalid)?;
    if hours.len() != 2 || minutes.len() != 2 {
        return Err(invalid());
    }
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    Ok(hours * 60 + minutes)
}
