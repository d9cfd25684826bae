//! Structured output validator.
//!
//! Everything downstream of this module assumes labels are vocabulary-constrained.

use crate::models::{CodebookError, LabelMode, LabelSet, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```(?:json)?\s*").expect("valid regex"));
static FENCE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*```$").expect("valid regex"));
static TRUNCATED_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\{\s*"label"\s*:\s*"([^"}\n]+)"#).expect("valid regex"));
static KEY_VALUE_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\s*label\s*[:=]\s*"?([^"}\n]+?)"?\s*$"#).expect("valid regex")
});

/// Strip markdown code fences around a JSON payload.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let start = FENCE_OPEN.find(trimmed).map_or(0, |m| m.end());
    let end = FENCE_CLOSE
        .find(&trimmed[start..])
        .map_or(trimmed.len(), |m| start + m.start());
    &trimmed[start..end]
}

/// Recover a single label from output that is not valid JSON.
///
/// Handles truncated objects (`{"label":"neg`), `label: neg` lines and a bare label.
fn recover_single_label(text: &str) -> Option<String> {
    if let Some(cap) = TRUNCATED_LABEL.captures(text) {
        return Some(cap[1].to_string());
    }
    if let Some(cap) = KEY_VALUE_LABEL.captures(text) {
        return Some(cap[1].trim().to_string());
    }
    if !text.is_empty() && !text.contains('\n') && !text.starts_with(['{', '[']) {
        return Some(text.to_string());
    }
    None
}

/// Pull the candidate string list out of a parsed response.
fn candidates(value: &Value, mode: LabelMode) -> Result<Vec<String>> {
    let inner = match value {
        Value::Object(map) => {
            let keys: &[&str] = match mode {
                LabelMode::Single => &["label"],
                LabelMode::Multi => &["labels", "label"],
                LabelMode::Open => &["keywords"],
            };
            keys.iter()
                .find_map(|k| map.get(*k))
                .ok_or_else(|| {
                    CodebookError::MalformedResponse(format!(
                        "expected field '{}' in response object",
                        keys[0]
                    ))
                })?
        }
        other => other,
    };

    match inner {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                scalar_text(item).ok_or_else(|| {
                    CodebookError::MalformedResponse(format!("expected string, got {item}"))
                })
            })
            .collect(),
        other => scalar_text(other).map(|s| vec![s]).ok_or_else(|| {
            CodebookError::MalformedResponse(format!(
                "expected string or list of strings, got {other}"
            ))
        }),
    }
}

/// Text of a string, number or boolean value. Numeric codebooks (`"1"`, `"2"`)
/// often come back unquoted.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn ensure_in_vocabulary(label: &str, label_set: &LabelSet) -> Result<()> {
    if label_set.contains(label) {
        Ok(())
    } else {
        Err(CodebookError::InvalidLabel {
            label: label.to_string(),
            allowed: label_set.labels().to_vec(),
        })
    }
}

/// Validate a raw LLM response against the governing label set.
///
/// - single: exactly one in-vocabulary label (`InvalidLabel` otherwise)
/// - multi: zero or more distinct in-vocabulary labels
/// - open: zero or more non-empty strings
pub fn validate_response(raw: &str, label_set: &LabelSet) -> Result<Vec<String>> {
    let body = strip_fences(raw);
    let mode = label_set.mode();

    let parsed = serde_json::from_str::<Value>(body);
    let bare_scalar = matches!(
        parsed,
        Ok(Value::Number(_) | Value::Bool(_) | Value::Null)
    );

    let labels = match parsed {
        // A bare scalar is the label as written: `1.50` stays `1.50`.
        Ok(_) if bare_scalar && mode == LabelMode::Single => vec![body.to_string()],
        Ok(value) => candidates(&value, mode)?,
        Err(_) if mode == LabelMode::Single => {
            let label = recover_single_label(body).ok_or_else(|| {
                CodebookError::MalformedResponse(format!(
                    "unparsable response: {}",
                    body.chars().take(80).collect::<String>()
                ))
            })?;
            vec![label]
        }
        Err(e) => {
            return Err(CodebookError::MalformedResponse(format!(
                "invalid JSON for {mode} mode: {e}"
            )));
        }
    };

    match mode {
        LabelMode::Single => {
            if labels.len() != 1 {
                return Err(CodebookError::MalformedResponse(format!(
                    "expected exactly one label, got {}",
                    labels.len()
                )));
            }
            ensure_in_vocabulary(&labels[0], label_set)?;
        }
        LabelMode::Multi => {
            let mut seen = HashSet::with_capacity(labels.len());
            for label in &labels {
                ensure_in_vocabulary(label, label_set)?;
                if !seen.insert(label.as_str()) {
                    return Err(CodebookError::MalformedResponse(format!(
                        "duplicate label '{label}'"
                    )));
                }
            }
        }
        LabelMode::Open => {
            if labels.iter().any(|k| k.trim().is_empty()) {
                return Err(CodebookError::MalformedResponse(
                    "keywords must be non-empty strings".to_string(),
                ));
            }
        }
    }

    Ok(labels)
}
