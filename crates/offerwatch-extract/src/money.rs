//! Price and currency parsing shared by every commerce extractor.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as JsonValue;

const MAX_PRICE_CENTS: i64 = 100_000_000;

static NUMBER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d.,]*").expect("number token regex"));

static ISO_CURRENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(USD|EUR|GBP|CAD|AUD|JPY)\b").expect("iso currency regex"));

/// Parses the first number in `text` into cents, accepting both `1,299.00`
/// and `1.299,00` grouping.
pub fn parse_price_to_cents(text: &str) -> Option<i64> {
    let token = NUMBER_TOKEN.find(text)?.as_str().trim_end_matches(['.', ',']);
    if token.is_empty() {
        return None;
    }

    let decimal_sep = match (token.rfind('.'), token.rfind(',')) {
        (Some(dot), Some(comma)) => Some(if dot > comma { '.' } else { ',' }),
        (Some(idx), None) | (None, Some(idx)) => {
            let sep = token[idx..].chars().next();
            let digits_after = token.len() - idx - 1;
            let occurrences = token.matches(sep.unwrap_or('.')).count();
            if digits_after == 3 || occurrences > 1 {
                None
            } else {
                sep
            }
        }
        (None, None) => None,
    };

    let (whole, fraction) = match decimal_sep {
        Some(sep) => {
            let idx = token.rfind(sep)?;
            (&token[..idx], &token[idx + 1..])
        }
        None => (token, ""),
    };

    let whole_digits: String = whole.chars().filter(char::is_ascii_digit).collect();
    let whole_value: i64 = if whole_digits.is_empty() {
        0
    } else {
        whole_digits.parse().ok()?
    };
    let fraction_cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction[..2].parse().ok()?,
    };

    let cents = whole_value.checked_mul(100)?.checked_add(fraction_cents)?;
    (cents > 0 && cents <= MAX_PRICE_CENTS).then_some(cents)
}

/// Price carried as a JSON number or string.
pub fn json_price_to_cents(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => {
            let cents = (n.as_f64()? * 100.0).round();
            (cents > 0.0 && cents <= MAX_PRICE_CENTS as f64).then_some(cents as i64)
        }
        JsonValue::String(s) => parse_price_to_cents(s),
        _ => None,
    }
}

/// Best-effort ISO currency from a price string, by code or symbol.
pub fn detect_currency(text: &str) -> Option<String> {
    if let Some(m) = ISO_CURRENCY.find(text) {
        return Some(m.as_str().to_string());
    }
    let code = if text.contains("CA$") || text.contains("C$") {
        "CAD"
    } else if text.contains("A$") {
        "AUD"
    } else if text.contains('$') {
        "USD"
    } else if text.contains('€') {
        "EUR"
    } else if text.contains('£') {
        "GBP"
    } else if text.contains('¥') {
        "JPY"
    } else {
        return None;
    };
    Some(code.to_string())
}

pub fn normalize_currency(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(trimmed.to_ascii_uppercase());
    }
    detect_currency(trimmed)
}
