//! Line-delimited request manifest and result-file codec.
//!
//! Each manifest line is a self-contained chat completion request tagged with
//! its `custom_id`. The label vocabulary travels inside `response_format`, so
//! a manifest downloaded from the service is enough to rebuild the requests.

use crate::classify::{label_set_from_format, validate_response};
use crate::client::{ChatCompletionBody, ChatCompletionResponse};
use crate::models::{
    ClassificationRequest, ClassificationResult, CodebookError, ItemError, LabelSet, ModelConfig,
    Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Endpoint every manifest line targets.
pub const BATCH_ENDPOINT: &str = "/v1/chat/completions";

/// One request line in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatCompletionBody,
}

/// Serialize requests into JSONL, one line per request, in order.
pub fn encode_manifest(requests: &[ClassificationRequest], model: &ModelConfig) -> Result<String> {
    let mut out = String::new();
    for request in requests {
        let line = ManifestLine {
            custom_id: request.external_id.clone(),
            method: "POST".to_string(),
            url: BATCH_ENDPOINT.to_string(),
            body: ChatCompletionBody::for_request(model, request),
        };
        let json = serde_json::to_string(&line).map_err(|e| {
            CodebookError::Internal(format!("failed to encode {}: {e}", request.external_id))
        })?;
        out.push_str(&json);
        out.push('\n');
    }
    Ok(out)
}

/// Rebuild requests from a manifest.
///
/// The text is the last user message; the label set is recovered from the
/// response format and shared between lines that carry the same one.
pub fn decode_manifest(content: &str) -> Result<Vec<ClassificationRequest>> {
    let mut requests = Vec::new();
    let mut current: Option<Arc<LabelSet>> = None;

    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ManifestLine = serde_json::from_str(line).map_err(|e| {
            CodebookError::ParseError(format!("manifest line {}: {e}", lineno + 1))
        })?;

        let text = parsed
            .body
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .ok_or_else(|| {
                CodebookError::ParseError(format!(
                    "manifest line {} ({}) has no user message",
                    lineno + 1,
                    parsed.custom_id
                ))
            })?;

        let label_set = label_set_from_format(&parsed.body.response_format)?;
        let label_set = match &current {
            Some(shared) if **shared == label_set => Arc::clone(shared),
            _ => {
                let fresh = Arc::new(label_set);
                current = Some(Arc::clone(&fresh));
                fresh
            }
        };

        requests.push(ClassificationRequest {
            external_id: parsed.custom_id,
            text,
            label_set,
        });
    }

    Ok(requests)
}

/// One line of an output or error file.
#[derive(Debug, Deserialize)]
struct ResultLine {
    custom_id: String,
    #[serde(default)]
    response: Option<ResultResponse>,
    #[serde(default)]
    error: Option<ResultError>,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    status_code: u16,
    #[serde(default)]
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ResultError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

fn remote_message(body: &serde_json::Value) -> String {
    body.pointer("/error/message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

/// Turn one result line into a result for its request.
fn resolve_line(request: &ClassificationRequest, line: ResultLine) -> ClassificationResult {
    if let Some(error) = line.error {
        return ClassificationResult::failure(
            request,
            ItemError::Remote {
                code: error.code,
                message: error.message,
            },
            None,
        );
    }

    let Some(response) = line.response else {
        return ClassificationResult::failure(
            request,
            ItemError::Remote {
                code: None,
                message: "result line has neither response nor error".to_string(),
            },
            None,
        );
    };

    if response.status_code != 200 {
        return ClassificationResult::failure(
            request,
            ItemError::Remote {
                code: Some(response.status_code.to_string()),
                message: remote_message(&response.body),
            },
            None,
        );
    }

    let content = serde_json::from_value::<ChatCompletionResponse>(response.body)
        .map_err(|e| CodebookError::MalformedResponse(format!("unreadable completion body: {e}")))
        .and_then(ChatCompletionResponse::into_content);

    match content {
        Ok(raw) => match validate_response(&raw, &request.label_set) {
            Ok(labels) => ClassificationResult::success(request, labels, raw),
            Err(e) => ClassificationResult::failure(request, ItemError::from_validation(e), Some(raw)),
        },
        Err(e) => ClassificationResult::failure(request, ItemError::from_validation(e), None),
    }
}

/// One failed request read back from an error file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRequest {
    pub custom_id: String,
    pub status_code: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

/// Every failure recorded in an error file, in file order.
///
/// Lines that answered 200 are not failures and are left out; unparsable
/// lines are logged and skipped.
pub fn parse_error_lines(content: &str) -> Vec<FailedRequest> {
    let mut failed = Vec::new();
    for (lineno, raw_line) in content.lines().enumerate() {
        if raw_line.trim().is_empty() {
            continue;
        }
        let line: ResultLine = match serde_json::from_str(raw_line) {
            Ok(line) => line,
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "Skipping unparsable error line");
                continue;
            }
        };

        let entry = match (line.error, line.response) {
            (Some(error), response) => FailedRequest {
                custom_id: line.custom_id,
                status_code: response.map(|r| r.status_code),
                code: error.code,
                message: error.message,
            },
            (None, Some(response)) if response.status_code != 200 => FailedRequest {
                custom_id: line.custom_id,
                status_code: Some(response.status_code),
                code: response
                    .body
                    .pointer("/error/code")
                    .and_then(|c| c.as_str())
                    .map(str::to_string),
                message: remote_message(&response.body),
            },
            (None, Some(_)) => continue,
            (None, None) => FailedRequest {
                custom_id: line.custom_id,
                status_code: None,
                code: None,
                message: "result line has neither response nor error".to_string(),
            },
        };
        failed.push(entry);
    }
    failed
}

/// Reassemble one result per manifest entry, in manifest order.
///
/// `files` are the output file and then the error file. Ids that appear in
/// neither become `MissingResult`.
pub fn assemble_results(
    manifest: &[ClassificationRequest],
    files: &[&str],
) -> Vec<ClassificationResult> {
    let index: HashMap<&str, &ClassificationRequest> = manifest
        .iter()
        .map(|r| (r.external_id.as_str(), r))
        .collect();
    let mut resolved: HashMap<String, ClassificationResult> = HashMap::with_capacity(manifest.len());

    for content in files {
        for (lineno, raw_line) in content.lines().enumerate() {
            if raw_line.trim().is_empty() {
                continue;
            }
            let line: ResultLine = match serde_json::from_str(raw_line) {
                Ok(line) => line,
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "Skipping unparsable result line");
                    continue;
                }
            };
            let Some(request) = index.get(line.custom_id.as_str()) else {
                warn!(custom_id = %line.custom_id, "Result for unknown id, ignoring");
                continue;
            };
            if resolved.contains_key(&line.custom_id) {
                debug!(custom_id = %line.custom_id, "Duplicate result line, keeping first");
                continue;
            }
            let id = line.custom_id.clone();
            resolved.insert(id, resolve_line(request, line));
        }
    }

    manifest
        .iter()
        .map(|request| {
            resolved.remove(&request.external_id).unwrap_or_else(|| {
                ClassificationResult::failure(request, ItemError::MissingResult, None)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::build_requests_from_texts;
    use crate::models::LabelMode;
    use serde_json::json;

    fn requests() -> Vec<ClassificationRequest> {
        let set = Arc::new(LabelSet::new(LabelMode::Single, ["pos", "neg"]).unwrap());
        build_requests_from_texts(set, &["good", "bad", "meh"]).unwrap()
    }

    fn ok_line(id: &str, content: &str) -> String {
        json!({
            "custom_id": id,
            "response": {
                "status_code": 200,
                "body": {"choices": [{"message": {"content": content}}]}
            },
            "error": null
        })
        .to_string()
    }

    #[test]
    fn test_error_lines_read_body_and_line_errors() {
        let content = [
            json!({
                "custom_id": "quote-00001",
                "response": {
                    "status_code": 400,
                    "body": {"error": {"code": "context_length_exceeded", "message": "too long"}}
                },
                "error": null
            })
            .to_string(),
            "not json".to_string(),
            json!({
                "custom_id": "quote-00002",
                "response": null,
                "error": {"code": "batch_expired", "message": "expired"}
            })
            .to_string(),
            ok_line("quote-00003", r#"{"label": "pos"}"#),
        ]
        .join("\n");

        let failed = parse_error_lines(&content);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].status_code, Some(400));
        assert_eq!(failed[0].code.as_deref(), Some("context_length_exceeded"));
        assert_eq!(failed[0].message, "too long");
        assert_eq!(failed[1].custom_id, "quote-00002");
        assert_eq!(failed[1].status_code, None);
        assert_eq!(failed[1].code.as_deref(), Some("batch_expired"));
    }

    #[test]
    fn test_manifest_lines_are_tagged_and_self_contained() {
        let manifest = encode_manifest(&requests(), &ModelConfig::default()).unwrap();
        let lines: Vec<_> = manifest.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["custom_id"], "quote-00001");
        assert_eq!(first["method"], "POST");
        assert_eq!(first["url"], BATCH_ENDPOINT);
        assert_eq!(first["body"]["messages"][1]["content"], "good");
    }

    #[test]
    fn test_decode_rebuilds_requests() {
        let original = requests();
        let manifest = encode_manifest(&original, &ModelConfig::default()).unwrap();
        let decoded = decode_manifest(&manifest).unwrap();

        assert_eq!(decoded, original);
        assert!(Arc::ptr_eq(&decoded[0].label_set, &decoded[2].label_set));
    }

    #[test]
    fn test_decode_reports_line_number() {
        match decode_manifest("\n{not json}\n") {
            Err(CodebookError::ParseError(msg)) => assert!(msg.contains("line 2")),
            other => panic!("expected ParseError, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_ids_are_surfaced() {
        let manifest = requests();
        let output = [
            ok_line("quote-00001", r#"{"label": "pos"}"#),
            ok_line("quote-00003", r#"{"label": "neg"}"#),
        ]
        .join("\n");

        let results = assemble_results(&manifest, &[&output]);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].assigned_labels, vec!["pos"]);
        assert_eq!(results[1].error, Some(ItemError::MissingResult));
        assert_eq!(results[2].assigned_labels, vec!["neg"]);
    }

    #[test]
    fn test_remote_errors_invalid_labels_and_noise() {
        let manifest = requests();
        let output = [
            ok_line("quote-00001", r#"{"label": "Happy"}"#),
            "garbage".to_string(),
            ok_line("unknown-id", r#"{"label": "pos"}"#),
            json!({
                "custom_id": "quote-00002",
                "response": {"status_code": 400, "body": {"error": {"message": "bad schema"}}}
            })
            .to_string(),
        ]
        .join("\n");
        let errors = json!({
            "custom_id": "quote-00003",
            "response": null,
            "error": {"code": "server_error", "message": "boom"}
        })
        .to_string();

        let results = assemble_results(&manifest, &[&output, &errors]);
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0].error,
            Some(ItemError::InvalidLabel {
                label: "Happy".into()
            })
        );
        assert_eq!(
            results[1].error,
            Some(ItemError::Remote {
                code: Some("400".into()),
                message: "bad schema".into()
            })
        );
        assert_eq!(
            results[2].error,
            Some(ItemError::Remote {
                code: Some("server_error".into()),
                message: "boom".into()
            })
        );
    }

    #[test]
    fn test_duplicate_lines_keep_first() {
        let manifest = requests();
        let output = [
            ok_line("quote-00001", r#"{"label": "pos"}"#),
            ok_line("quote-00001", r#"{"label": "neg"}"#),
        ]
        .join("\n");
        let results = assemble_results(&manifest, &[&output]);
        assert_eq!(results[0].assigned_labels, vec!["pos"]);
    }
}
