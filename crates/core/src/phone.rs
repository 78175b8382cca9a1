//! Phone number canonicalization.
//!
//! Every identity lookup keys on the canonical digit form produced here: all
//! non-digits stripped, and a bare 10-digit NANP number prefixed with `1`.
//! An empty string means "no usable phone".

use serde_json::Value;

/// Canonical digit form of any raw phone representation.
pub fn normalize_e164_digits(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 10 {
        return format!("1{digits}");
    }
    digits
}

/// `+`-prefixed display form of the canonical digits, or empty.
pub fn normalize_e164(raw: &str) -> String {
    let digits = normalize_e164_digits(raw);
    if digits.is_empty() {
        return digits;
    }
    format!("+{digits}")
}

/// 10-digit local variant used by providers that drop the country code.
pub fn local_digits(raw: &str) -> String {
    let digits = normalize_e164_digits(raw);
    match digits.strip_prefix('1') {
        Some(rest) if digits.len() == 11 => rest.to_string(),
        _ => digits,
    }
}

/// Normalizes the shapes providers use for phone fields: a plain string, an
/// object carrying `phone_number`, or an array of such objects.
pub fn normalize_value(value: &Value) -> String {
    match value {
        Value::String(raw) => normalize_e164_digits(raw),
        Value::Number(number) => normalize_e164_digits(&number.to_string()),
        Value::Object(map) => {
            map.get("phone_number").map(normalize_value).unwrap_or_default()
        }
        Value::Array(items) => items
            .iter()
            .map(normalize_value)
            .find(|digits| !digits.is_empty())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// Both canonical and local spellings, for lookups against rows written by
/// older code paths that stored either form.
pub fn lookup_variants(raw: &str) -> Vec<String> {
    let canonical = normalize_e164_digits(raw);
    if canonical.is_empty() {
        return Vec::new();
    }
    let local = local_digits(raw);
    let mut variants = vec![canonical.clone(), format!("+{canonical}")];
    if local != canonical {
        variants.push(local);
    }
    variants
}
