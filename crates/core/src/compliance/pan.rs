use std::sync::OnceLock;

use regex::Regex;

/// Text with every card number replaced by `[REDACTED_CARD_<last4>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redaction {
    pub text: String,
    pub card_detected: bool,
}

fn candidate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\d(?:[ -]?\d)*")
            .unwrap_or_else(|_| unreachable!("card candidate pattern is valid"))
    })
}

/// A run of digits inside a candidate, with its byte span in the source text.
struct DigitGroup {
    start: usize,
    end: usize,
    digits: usize,
}

pub fn redact_pan(text: &str) -> Redaction {
    if text.trim().is_empty() {
        return Redaction { text: text.to_string(), card_detected: false };
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut card_detected = false;

    for candidate in candidate_pattern().find_iter(text) {
        for (start, end) in card_spans(text, candidate.start(), candidate.end()) {
            let digits: String = text[start..end].chars().filter(char::is_ascii_digit).collect();
            out.push_str(&text[last..start]);
            out.push_str("[REDACTED_CARD_");
            out.push_str(&digits[digits.len() - 4..]);
            out.push(']');
            last = end;
            card_detected = true;
        }
    }

    if !card_detected {
        return Redaction { text: text.to_string(), card_detected: false };
    }
    out.push_str(&text[last..]);
    Redaction { text: out, card_detected }
}

/// Card numbers inside one run of digits and single separators. The run may
/// carry extra digits on either side (an expiry, a CVV, a room number), so
/// every window of whole digit groups holding 13 to 19 digits is tried,
/// shortest first, and the first that passes Luhn is taken.
fn card_spans(text: &str, from: usize, to: usize) -> Vec<(usize, usize)> {
    let groups = digit_groups(text, from, to);
    let mut spans = Vec::new();
    let mut first = 0;
    while first < groups.len() {
        let mut found = None;
        let mut digits = 0;
        for (last, group) in groups.iter().enumerate().skip(first) {
            digits += group.digits;
            if digits > 19 {
                break;
            }
            if digits >= 13 && luhn_valid(&digits_in(text, groups[first].start, group.end)) {
                found = Some(last);
                break;
            }
        }
        match found {
            Some(last) => {
                spans.push((groups[first].start, groups[last].end));
                first = last + 1;
            }
            None => {
                if let Some(span) = compact_card(text, &groups[first]) {
                    spans.push(span);
                }
                first += 1;
            }
        }
    }
    spans
}

fn digit_groups(text: &str, from: usize, to: usize) -> Vec<DigitGroup> {
    let mut groups: Vec<DigitGroup> = Vec::new();
    for (offset, ch) in text[from..to].char_indices() {
        let at = from + offset;
        if !ch.is_ascii_digit() {
            continue;
        }
        match groups.last_mut() {
            Some(group) if group.end == at => {
                group.end = at + 1;
                group.digits += 1;
            }
            _ => groups.push(DigitGroup { start: at, end: at + 1, digits: 1 }),
        }
    }
    groups
}

/// An unbroken run longer than a card, such as a card with the CVV typed
/// straight after it. Only the common 16 and 15 digit prefixes are tried.
fn compact_card(text: &str, group: &DigitGroup) -> Option<(usize, usize)> {
    if group.digits <= 16 {
        return None;
    }
    let run = &text[group.start..group.end];
    [16, 15]
        .into_iter()
        .find(|len| luhn_valid(&run[..*len]))
        .map(|len| (group.start, group.start + len))
}

fn digits_in(text: &str, start: usize, end: usize) -> String {
    text[start..end].chars().filter(char::is_ascii_digit).collect()
}

fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (index, ch) in digits.chars().rev().enumerate() {
        let Some(mut value) = ch.to_digit(10) else {
            return false;
        };
        if index % 2 == 1 {
            value *= 2;
            if value > 9 {
                value -= 9;
            }
        }
        sum += value;
    }
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::{luhn_valid, redact_pan};

    #[test]
    fn sixteen_digit_card_keeps_only_last_four() {
        let redaction = redact_pan("my card is 4111 1111 1111 1111 thanks");
        assert!(redaction.card_detected);
        assert_eq!(redaction.text, "my card is [REDACTED_CARD_1111] thanks");
        assert!(!redaction.text.contains("4111 1111"));
    }

    #[test]
    fn dashed_and_compact_forms_are_redacted() {
        let redaction = redact_pan("5555-5555-5555-4444 or 378282246310005");
        assert!(redaction.card_detected);
        assert_eq!(redaction.text, "[REDACTED_CARD_4444] or [REDACTED_CARD_0005]");
    }

    #[test]
    fn non_luhn_numbers_and_short_digits_pass_through() {
        let redaction = redact_pan("order 1234567890123 at 555-0001");
        assert!(!redaction.card_detected);
        assert_eq!(redaction.text, "order 1234567890123 at 555-0001");
    }

    #[test]
    fn expiry_after_the_card_does_not_hide_it() {
        let redaction = redact_pan("my card 4111 1111 1111 1111 12/26");
        assert!(redaction.card_detected);
        assert_eq!(redaction.text, "my card [REDACTED_CARD_1111] 12/26");
    }

    #[test]
    fn cvv_after_the_card_does_not_hide_it() {
        let redaction = redact_pan("4111111111111111 123");
        assert!(redaction.card_detected);
        assert_eq!(redaction.text, "[REDACTED_CARD_1111] 123");

        let dashed = redact_pan("card 5555-5555-5555-4444-321 exp 0927");
        assert_eq!(dashed.text, "card [REDACTED_CARD_4444]-321 exp 0927");

        let glued = redact_pan("4111111111111111123");
        assert_eq!(glued.text, "[REDACTED_CARD_1111]123");
    }

    #[test]
    fn digits_before_the_card_are_skipped() {
        let redaction = redact_pan("room 12 4111 1111 1111 1111");
        assert!(redaction.card_detected);
        assert_eq!(redaction.text, "room 12 [REDACTED_CARD_1111]");
    }

    #[test]
    fn luhn_reference_values() {
        assert!(luhn_valid("4111111111111111"));
        assert!(!luhn_valid("4111111111111112"));
    }
}
