//! Tolerant parsing of the Checker's free-form verdict text.
//!
//! The Checker must produce a JSON object `{verdict, reason, feedback,
//! verified}`, possibly wrapped in a ```json fence. The first syntactically
//! valid JSON object wins; `verdict = "passed"` is the only success token.
//! A parse failure fails the cycle, never the session.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::models::{CheckerOutcome, LlmResult};

/// Parse the Checker worker's result into an outcome.
pub fn parse_checker_verdict(result: &LlmResult) -> CheckerOutcome {
    if let Some(error) = &result.error {
        return CheckerOutcome::failed(
            format!("checker_error: {error}"),
            Some(json!({"error_feedback": format!("Checker failed: {error}")})),
        );
    }

    let Some(data) = extract_json_object(&result.text) else {
        tracing::error!("failed to parse checker verdict");
        let preview: String = result.text.chars().take(200).collect();
        return CheckerOutcome::failed(
            "checker_parsing_error",
            Some(json!({
                "review_feedback": format!("Checker output was malformed: {preview}..."),
            })),
        );
    };

    let verdict = data
        .get("verdict")
        .and_then(Value::as_str)
        .unwrap_or("failed")
        .to_owned();
    let reason = data
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let feedback = data.get("feedback").cloned().unwrap_or(Value::Null);
    let verified = data.get("verified").cloned().unwrap_or_else(|| json!([]));

    if verdict == "passed" {
        CheckerOutcome::passed("verified_passed")
    } else {
        CheckerOutcome::failed(
            format!("{verdict}: {reason}"),
            Some(json!({
                "review_verdict": verdict,
                "review_feedback": feedback,
                "review_reason": reason,
                "verified_items": verified,
            })),
        )
    }
}

/// Locate and parse the first JSON object in free-form text.
///
/// Tries, in order: a ```json fence, the first balanced `{…}` span, and a
/// best-effort repair (trailing-comma removal) of that span.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let candidate = fenced_json(text).or_else(|| balanced_object(text))?;

    match serde_json::from_str::<Value>(&candidate) {
        Ok(Value::Object(map)) => Some(Value::Object(map)),
        _ => {
            let repaired = repair_json(&candidate);
            match serde_json::from_str::<Value>(&repaired) {
                Ok(Value::Object(map)) => Some(Value::Object(map)),
                _ => None,
            }
        }
    }
}

/// Contents of the first ```json fence, if any.
fn fenced_json(text: &str) -> Option<String> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("fence regex is valid")
    });
    fence
        .captures(text)
        .map(|captures| captures[1].to_owned())
}

/// The first balanced `{…}` span, respecting strings and escapes.
fn balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_owned());
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort repair: strip trailing commas before closing brackets.
/// Enough for the common failure mode of model-generated JSON.
pub fn repair_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' if in_string => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = !in_string;
                out.push(ch);
            }
            '}' | ']' if !in_string => {
                // Drop a dangling comma (plus whitespace) before the close.
                while out
                    .trim_end()
                    .ends_with(',')
                {
                    let trimmed_len = out.trim_end().len();
                    out.truncate(trimmed_len - 1);
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
