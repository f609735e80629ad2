// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Deep redaction of sensitive strings in audit entries (§4.4). Pure data
//! transformation over a `serde_json::Value` tree, applied as a
//! post-processing pass immediately before serialization — never
//! interleaved into the orchestrator (§9).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Candidate-matching regexes. Each avoids nested quantifiers on the same
/// character class (ReDoS resistance, §4.4): digit runs and key prefixes are
/// matched with single bounded repetitions, never `(\d+)+` style nesting.
static CREDIT_CARD_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[0-9][ -]?){13,19}\b").expect("valid regex"));

static SSN_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid regex"));

static API_KEY_PREFIXES: &[&str] = &["sk-", "ghp_", "xoxb-", "xoxp-", "AKIA"];

const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

/// Deep-redact every string value reachable from `value`, in place. Leaves
/// non-string values (numbers, bools, `null`) untouched and never removes a
/// key, so `result.status` and JSON shape both survive unchanged.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            *s = redact_string(s);
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item);
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                redact_value(v);
            }
        }
        _ => {}
    }
}

/// Redact one string, replacing any matched span with the placeholder.
/// Idempotent: redacting an already-redacted string is a no-op since the
/// placeholder itself matches none of the patterns.
pub fn redact_string(input: &str) -> String {
    let mut result = input.to_string();
    result = redact_api_key_prefixes(&result);
    result = redact_pattern(&result, &CREDIT_CARD_CANDIDATE, is_luhn_valid_digits);
    result = redact_pattern(&result, &SSN_CANDIDATE, is_plausible_ssn);
    result
}

fn redact_pattern(input: &str, pattern: &Regex, validator: impl Fn(&str) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;
    for m in pattern.find_iter(input) {
        if validator(m.as_str()) {
            out.push_str(&input[last_end..m.start()]);
            out.push_str(REDACTED_PLACEHOLDER);
            last_end = m.end();
        }
    }
    out.push_str(&input[last_end..]);
    out
}

fn redact_api_key_prefixes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    'outer: loop {
        for prefix in API_KEY_PREFIXES {
            if let Some(idx) = rest.find(prefix) {
                // Only redact if this looks like the start of a token: not
                // preceded by an alphanumeric character (avoids chewing
                // into unrelated words that happen to contain the prefix).
                let boundary_ok = idx == 0
                    || !rest.as_bytes()[idx - 1].is_ascii_alphanumeric();
                if boundary_ok {
                    let token_end = rest[idx..]
                        .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
                        .map(|offset| idx + offset)
                        .unwrap_or(rest.len());
                    out.push_str(&rest[..idx]);
                    out.push_str(REDACTED_PLACEHOLDER);
                    rest = &rest[token_end..];
                    continue 'outer;
                }
            }
        }
        break;
    }
    out.push_str(rest);
    out
}

/// Standard Luhn checksum over a digit run that may contain spaces/dashes.
fn is_luhn_valid_digits(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let mut sum = 0;
    let mut double = false;
    for &digit in digits.iter().rev() {
        let mut d = digit;
        if double {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
        double = !double;
    }
    sum % 10 == 0
}

/// US SSN shape `AAA-GG-SSSS` excluding invalid area (000, 666, 900-999),
/// group (00), and serial (0000) ranges.
fn is_plausible_ssn(candidate: &str) -> bool {
    let parts: Vec<&str> = candidate.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let area: u32 = match parts[0].parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    let group: u32 = match parts[1].parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    let serial: u32 = match parts[2].parse() {
        Ok(v) => v,
        Err(_) => return false,
    };

    if area == 0 || area == 666 || (900..=999).contains(&area) {
        return false;
    }
    if group == 0 {
        return false;
    }
    if serial == 0 {
        return false;
    }
    true
}
