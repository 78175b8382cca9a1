use std::sync::OnceLock;

use regex::Regex;

use ringback_core::compliance::pan::redact_pan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyDecision {
    Send { text: String, redacted: bool },
    Suppress { reason_code: &'static str },
}

impl ReplyDecision {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Send { text, .. } => Some(text),
            Self::Suppress { .. } => None,
        }
    }
}

struct LeakPattern {
    pattern: Regex,
    reason_code: &'static str,
}

fn leak_patterns() -> &'static [LeakPattern] {
    static PATTERNS: OnceLock<Vec<LeakPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                r"(?i)(api[_\s]?key|secret[_\s]?key|access[_\s]?token|bearer\s+token)\s*[:=]\s*\S+",
                "leak_credential",
            ),
            (r"(?i)\b(sk|pk)[-_](live|test)[-_][a-z0-9]{20,}", "leak_payment_key"),
            (r"\bAKIA[A-Z0-9]{16}\b", "leak_cloud_key"),
            (r"(?i)\b(postgres|mysql|redis|mongodb|sqlite)://\S+", "leak_database_url"),
            (r"(?i)/(admin|webhooks|internal|debug)/", "leak_internal_path"),
            (r"(?i)my (system\s+)?prompt\s+(is|says|tells|instructs)", "leak_system_prompt"),
        ]
        .into_iter()
        .filter_map(|(source, reason_code)| {
            Regex::new(source).ok().map(|pattern| LeakPattern { pattern, reason_code })
        })
        .collect()
    })
}

/// Last check on AI output before it is texted to a patient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyGuard {
    pub max_chars: usize,
}

impl Default for ReplyGuard {
    fn default() -> Self {
        Self { max_chars: 1_600 }
    }
}

impl ReplyGuard {
    pub fn evaluate(&self, reply: &str) -> ReplyDecision {
        let trimmed = reply.trim();
        if trimmed.is_empty() {
            return ReplyDecision::Suppress { reason_code: "empty_reply" };
        }

        if let Some(leak) = leak_patterns().iter().find(|leak| leak.pattern.is_match(trimmed)) {
            return ReplyDecision::Suppress { reason_code: leak.reason_code };
        }

        let redaction = redact_pan(trimmed);
        let mut text = redaction.text;
        if text.chars().count() > self.max_chars {
            text = text.chars().take(self.max_chars).collect();
        }
        ReplyDecision::Send { text, redacted: redaction.card_detected }
    }
}

#[cfg(test)]
mod tests {
    use super::{ReplyDecision, ReplyGuard};

    #[test]
    fn clean_reply_is_trimmed_and_sent() {
        let decision = ReplyGuard::default().evaluate("  We have openings Tuesday at 3pm.  \n");
        assert_eq!(
            decision,
            ReplyDecision::Send { text: "We have openings Tuesday at 3pm.".to_string(), redacted: false }
        );
    }

    #[test]
    fn echoed_card_number_is_redacted() {
        let decision = ReplyGuard::default().evaluate("Got it, card 4111 1111 1111 1111 on file.");

        let (text, redacted) = match decision {
            ReplyDecision::Send { text, redacted } => (text, redacted),
            ReplyDecision::Suppress { .. } => (String::new(), false),
        };
        assert!(redacted);
        assert!(!text.contains("4111 1111 1111 1111"));
        assert!(text.contains("1111"));
    }

    #[test]
    fn empty_and_leaking_replies_are_suppressed() {
        let guard = ReplyGuard::default();
        assert_eq!(guard.evaluate("   "), ReplyDecision::Suppress { reason_code: "empty_reply" });
        assert_eq!(
            guard.evaluate("Sure, the api_key: abc123 should work"),
            ReplyDecision::Suppress { reason_code: "leak_credential" }
        );
        assert_eq!(
            guard.evaluate("Check https://example.com/webhooks/messages for details"),
            ReplyDecision::Suppress { reason_code: "leak_internal_path" }
        );
        assert!(guard.evaluate("   ").text().is_none());
    }

    #[test]
    fn long_reply_is_capped() {
        let guard = ReplyGuard { max_chars: 10 };
        let decision = guard.evaluate("abcdefghijklmnop");
        assert_eq!(decision.text(), Some("abcdefghij"));
    }
}
