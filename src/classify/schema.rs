//! Prompts and strict JSON schemas for structured classification output.
//!
//! The schema doubles as the vocabulary carrier in batch manifests: a label
//! set can be recovered from a `response_format` with `label_set_from_format`.

use crate::client::Message;
use crate::models::{CodebookError, LabelMode, LabelSet, Result};
use serde_json::{Value, json};

pub const SINGLE_LABEL_SCHEMA: &str = "SingleLabel";
pub const MULTI_LABEL_SCHEMA: &str = "MultiLabel";
pub const KEYWORD_SCHEMA: &str = "KeywordExtraction";

/// Name of the structured-output schema for a mode.
pub fn schema_name(mode: LabelMode) -> &'static str {
    match mode {
        LabelMode::Single => SINGLE_LABEL_SCHEMA,
        LabelMode::Multi => MULTI_LABEL_SCHEMA,
        LabelMode::Open => KEYWORD_SCHEMA,
    }
}

/// JSON schema constraining the response to the label set.
pub fn response_schema(label_set: &LabelSet) -> Value {
    match label_set.mode() {
        LabelMode::Single => json!({
            "type": "object",
            "properties": {
                "label": { "type": "string", "enum": label_set.labels() }
            },
            "required": ["label"],
            "additionalProperties": false
        }),
        LabelMode::Multi => json!({
            "type": "object",
            "properties": {
                "labels": {
                    "type": "array",
                    "items": { "type": "string", "enum": label_set.labels() },
                    "uniqueItems": true
                }
            },
            "required": ["labels"],
            "additionalProperties": false
        }),
        LabelMode::Open => json!({
            "type": "object",
            "properties": {
                "keywords": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["keywords"],
            "additionalProperties": false
        }),
    }
}

/// `response_format` payload for a chat completion request.
pub fn response_format(label_set: &LabelSet) -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": schema_name(label_set.mode()),
            "strict": true,
            "schema": response_schema(label_set)
        }
    })
}

/// System instructions for a mode.
pub fn system_prompt(label_set: &LabelSet) -> String {
    match label_set.mode() {
        LabelMode::Single => format!(
            "You are a strict text classifier. Label the user's text with exactly one label \
             from the allowed set. Allowed labels: {}. Respond only with JSON matching the schema.",
            label_set.labels().join(", ")
        ),
        LabelMode::Multi => format!(
            "You are a strict text classifier. Label the user's text with every applicable label \
             from the allowed set, or none if nothing applies. Allowed labels: {}. \
             Respond only with JSON matching the schema.",
            label_set.labels().join(", ")
        ),
        LabelMode::Open => "You are an expert at structured data extraction. Extract the keywords \
             from the user's text. Respond only with JSON matching the schema."
            .to_string(),
    }
}

/// Messages for classifying `text`. The user message is the text verbatim.
pub fn build_messages(label_set: &LabelSet, text: &str) -> Vec<Message> {
    vec![Message::system(system_prompt(label_set)), Message::user(text)]
}

/// Recover the label set a `response_format` was built from.
pub fn label_set_from_format(format: &Value) -> Result<LabelSet> {
    let spec = format
        .get("json_schema")
        .ok_or_else(|| CodebookError::ParseError("response_format has no json_schema".into()))?;
    let name = spec.get("name").and_then(Value::as_str).unwrap_or_default();
    let properties = spec
        .pointer("/schema/properties")
        .ok_or_else(|| CodebookError::ParseError("schema has no properties".into()))?;

    let enum_values = |pointer: &str| -> Result<Vec<String>> {
        properties
            .pointer(pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| CodebookError::ParseError(format!("schema {name} has no label enum")))?
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    CodebookError::ParseError(format!("schema {name} has a non-string label"))
                })
            })
            .collect()
    };

    match name {
        SINGLE_LABEL_SCHEMA => LabelSet::new(LabelMode::Single, enum_values("/label/enum")?),
        MULTI_LABEL_SCHEMA => LabelSet::new(LabelMode::Multi, enum_values("/labels/items/enum")?),
        KEYWORD_SCHEMA => Ok(LabelSet::open()),
        other => Err(CodebookError::ParseError(format!(
            "unknown response schema '{other}'"
        ))),
    }
}
