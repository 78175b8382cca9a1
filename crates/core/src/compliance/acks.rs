use serde::Serialize;
use tera::{Context, Tera};

use super::ComplianceBuildError;

pub const DEFAULT_STOP_ACK: &str = "You have been opted out and will receive no further messages. Reply START to resubscribe.";
pub const DEFAULT_HELP_ACK: &str =
    "{% if clinic_name %}{{ clinic_name }}: {% endif %}Reply STOP to opt out. Msg & data rates may apply.";
pub const DEFAULT_START_ACK: &str = "You have been resubscribed. Reply STOP to opt out.";
pub const DEFAULT_SMS_ACK: &str = "Got it - give me a moment to help you.";
pub const DEFAULT_MISSED_CALL_ACK: &str = "Hi there! Sorry we missed your call. I'm the virtual receptionist{% if clinic_name %} for {{ clinic_name }}{% endif %} and can answer questions or book an appointment. Which service are you interested in? Reply STOP to opt out.";
pub const DEFAULT_CARD_ACK: &str = "For your security, please don't send card numbers by text. We removed it from our records and will share a secure payment link instead.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    Stop,
    Help,
    Start,
    Sms,
    MissedCall,
    Card,
}

impl AckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Help => "help",
            Self::Start => "start",
            Self::Sms => "sms",
            Self::MissedCall => "missed_call",
            Self::Card => "card",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckTemplates {
    pub stop: String,
    pub help: String,
    pub start: String,
    pub sms: String,
    pub missed_call: String,
    pub card: String,
}

impl Default for AckTemplates {
    fn default() -> Self {
        Self {
            stop: DEFAULT_STOP_ACK.to_string(),
            help: DEFAULT_HELP_ACK.to_string(),
            start: DEFAULT_START_ACK.to_string(),
            sms: DEFAULT_SMS_ACK.to_string(),
            missed_call: DEFAULT_MISSED_CALL_ACK.to_string(),
            card: DEFAULT_CARD_ACK.to_string(),
        }
    }
}

impl AckTemplates {
    fn template(&self, kind: AckKind) -> &str {
        match kind {
            AckKind::Stop => &self.stop,
            AckKind::Help => &self.help,
            AckKind::Start => &self.start,
            AckKind::Sms => &self.sms,
            AckKind::MissedCall => &self.missed_call,
            AckKind::Card => &self.card,
        }
    }
}

/// Renders acknowledgment texts. Templates are checked once at construction
/// so a bad template fails startup instead of a live reply.
#[derive(Clone, Debug)]
pub struct AckRenderer {
    templates: AckTemplates,
}

impl AckRenderer {
    pub fn new(templates: AckTemplates) -> Result<Self, ComplianceBuildError> {
        let renderer = Self { templates };
        for kind in [
            AckKind::Stop,
            AckKind::Help,
            AckKind::Start,
            AckKind::Sms,
            AckKind::MissedCall,
            AckKind::Card,
        ] {
            if renderer.templates.template(kind).trim().is_empty() {
                return Err(ComplianceBuildError::Template {
                    kind: kind.as_str(),
                    message: "template text required".to_string(),
                });
            }
            renderer.render(kind, Some("Sample Clinic"))?;
        }
        Ok(renderer)
    }

    pub fn render(
        &self,
        kind: AckKind,
        clinic_name: Option<&str>,
    ) -> Result<String, ComplianceBuildError> {
        let mut context = Context::new();
        context.insert("clinic_name", clinic_name.map(str::trim).unwrap_or_default());
        Tera::one_off(self.templates.template(kind), &context, false).map_err(|err| {
            ComplianceBuildError::Template { kind: kind.as_str(), message: err.to_string() }
        })
    }
}
