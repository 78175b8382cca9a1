//! Compliance rules applied to every inbound and outbound message: opt-out
//! keywords, payment-card redaction, quiet hours and the acknowledgment texts
//! that go with them.

pub mod acks;
pub mod keywords;
pub mod pan;
pub mod quiet_hours;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use acks::{AckKind, AckRenderer, AckTemplates};
pub use keywords::{Keyword, KeywordDetector};
pub use pan::{redact_pan, Redaction};
pub use quiet_hours::{MessagePurpose, QuietHours};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ComplianceBuildError {
    #[error("keyword set `{0}` must contain at least one word")]
    EmptyKeywordSet(&'static str),
    #[error("invalid keyword pattern: {0}")]
    Pattern(String),
    #[error("invalid clock value `{0}` (expected HH:MM)")]
    Clock(String),
    #[error("unknown timezone `{0}`")]
    Timezone(String),
    #[error("ack template `{kind}` failed: {message}")]
    Template { kind: &'static str, message: String },
}

/// What the ingestion path needs to know about one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundAssessment {
    pub keyword: Keyword,
    pub redaction: Redaction,
}

impl InboundAssessment {
    /// The acknowledgment that replaces AI dispatch, if any.
    pub fn compliance_ack(&self) -> Option<AckKind> {
        match self.keyword {
            Keyword::Stop => Some(AckKind::Stop),
            Keyword::Help => Some(AckKind::Help),
            Keyword::Start => Some(AckKind::Start),
            Keyword::None if self.redaction.card_detected => Some(AckKind::Card),
            Keyword::None => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ComplianceEngine {
    detector: KeywordDetector,
    quiet_hours: Option<QuietHours>,
    acks: AckRenderer,
}

impl ComplianceEngine {
    pub fn new(detector: KeywordDetector, quiet_hours: Option<QuietHours>, acks: AckRenderer) -> Self {
        Self { detector, quiet_hours, acks }
    }

    /// Keyword detection runs on the raw text; everything downstream only ever
    /// sees the redacted body.
    pub fn assess_inbound(&self, text: &str) -> InboundAssessment {
        InboundAssessment { keyword: self.detector.classify(text), redaction: redact_pan(text) }
    }

    pub fn is_quiet(&self, now: DateTime<Utc>, purpose: MessagePurpose) -> bool {
        self.quiet_hours.map(|window| window.is_suppressed(now, purpose)).unwrap_or(false)
    }

    pub fn render_ack(
        &self,
        kind: AckKind,
        clinic_name: Option<&str>,
    ) -> Result<String, ComplianceBuildError> {
        self.acks.render(kind, clinic_name)
    }

    pub fn detector(&self) -> &KeywordDetector {
        &self.detector
    }
}

impl Default for ComplianceEngine {
    fn default() -> Self {
        let acks = AckRenderer::new(AckTemplates::default())
            .unwrap_or_else(|_| unreachable!("default ack templates render"));
        Self::new(KeywordDetector::default(), None, acks)
    }
}

#[cfg(test)]
mod tests {
    use super::{AckKind, ComplianceEngine, Keyword};

    #[test]
    fn stop_takes_precedence_over_card_guardrail() {
        let engine = ComplianceEngine::default();
        let assessment = engine.assess_inbound("STOP 4111111111111111");
        assert_eq!(assessment.keyword, Keyword::Stop);
        assert!(assessment.redaction.card_detected);
        assert_eq!(assessment.compliance_ack(), Some(AckKind::Stop));
    }

    #[test]
    fn card_number_without_keyword_yields_card_ack() {
        let engine = ComplianceEngine::default();
        let assessment = engine.assess_inbound("here it is 4111-1111-1111-1111");
        assert_eq!(assessment.compliance_ack(), Some(AckKind::Card));
        assert_eq!(assessment.redaction.text, "here it is [REDACTED_CARD_1111]");
    }

    #[test]
    fn ordinary_message_needs_no_ack() {
        let engine = ComplianceEngine::default();
        assert_eq!(engine.assess_inbound("Need info").compliance_ack(), None);
    }
}
