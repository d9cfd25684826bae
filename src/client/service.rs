//! Service seams between the engines and the LLM provider.
//!
//! `LiveEngine` only needs `ClassificationService`; `BatchManager` only needs
//! `BatchService`. `LLMClient` implements both against an OpenAI-compatible
//! API, and tests substitute in-memory fakes.

use crate::models::{ClassificationRequest, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Synchronous, per-request classification.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    /// Send one request and return the raw model output.
    ///
    /// A single attempt: retries and validation are the caller's concern.
    async fn classify(&self, request: &ClassificationRequest) -> Result<String>;
}

/// Asynchronous bulk job API.
#[async_trait]
pub trait BatchService: Send + Sync {
    /// Upload a JSONL manifest and return the remote file id.
    async fn upload_file(&self, filename: &str, content: Vec<u8>) -> Result<String>;

    /// Create a job over an uploaded input file.
    async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: &str,
        completion_window: &str,
    ) -> Result<RemoteBatch>;

    async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch>;

    async fn cancel_batch(&self, batch_id: &str) -> Result<RemoteBatch>;

    /// Download a file (input, output or error) as text.
    async fn file_content(&self, file_id: &str) -> Result<String>;

    /// Most recent jobs first.
    async fn list_batches(&self, limit: usize) -> Result<Vec<RemoteBatch>>;
}

/// A job as reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub input_file_id: Option<String>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub request_counts: Option<RequestCounts>,
    /// Job-level errors, e.g. a manifest rejected during validation
    #[serde(default)]
    pub errors: Option<BatchErrors>,
}

/// The `errors` list object attached to a failed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchErrors {
    #[serde(default)]
    pub data: Vec<BatchErrorDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    /// Manifest field the error refers to
    #[serde(default)]
    pub param: Option<String>,
    /// 1-based manifest line
    #[serde(default)]
    pub line: Option<u64>,
}

impl std::fmt::Display for BatchErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(line) = self.line {
            write!(f, "line {line}: ")?;
        }
        if let Some(code) = &self.code {
            write!(f, "[{code}] ")?;
        }
        f.write_str(&self.message)
    }
}

/// Per-job request tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_batch_tolerates_sparse_payloads() {
        let batch: RemoteBatch = serde_json::from_str(
            r#"{"id": "batch_1", "status": "validating", "object": "batch", "metadata": null}"#,
        )
        .unwrap();
        assert_eq!(batch.id, "batch_1");
        assert_eq!(batch.status, "validating");
        assert!(batch.output_file_id.is_none());
        assert!(batch.request_counts.is_none());
    }

    #[test]
    fn test_remote_batch_reads_job_errors() {
        let batch: RemoteBatch = serde_json::from_str(
            r#"{"id": "b", "status": "failed", "errors": {"object": "list", "data": [
                {"code": "invalid_json_line", "message": "bad line", "param": null, "line": 3}
            ]}}"#,
        )
        .unwrap();
        let errors = batch.errors.unwrap().data;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "line 3: [invalid_json_line] bad line");
    }

    #[test]
    fn test_remote_batch_reads_counts() {
        let batch: RemoteBatch = serde_json::from_str(
            r#"{"id": "b", "status": "completed", "output_file_id": "file-out",
                "request_counts": {"total": 3, "completed": 2, "failed": 1}}"#,
        )
        .unwrap();
        assert_eq!(
            batch.request_counts,
            Some(RequestCounts {
                total: 3,
                completed: 2,
                failed: 1
            })
        );
    }
}
