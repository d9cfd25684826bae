//! Error types for codebook.
//!
//! Two families live here:
//! - `CodebookError`: structural failures that abort the operation that raised them
//! - `ItemError`: per-item failures recorded as data on a `ClassificationResult`

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for codebook.
#[derive(Debug, Error)]
pub enum CodebookError {
    // ═══════════════════════════════════════════════════════════════════
    // Caller input and contract violations
    // ═══════════════════════════════════════════════════════════════════
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid label '{label}': not one of [{}]", .allowed.join(", "))]
    InvalidLabel { label: String, allowed: Vec<String> },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Cannot {operation} batch job {job_id} in state {state}")]
    JobState {
        job_id: String,
        operation: &'static str,
        state: String,
    },

    #[error("No overlapping texts between '{dataset_a}' and '{dataset_b}'")]
    NoOverlap { dataset_a: String, dataset_b: String },

    #[error("Cohen's kappa undefined: chance agreement is 1 but observed agreement is {observed_agreement}")]
    UndefinedKappa { observed_agreement: f64 },

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // External service failures
    // ═══════════════════════════════════════════════════════════════════
    #[error("LLM service error: {0}")]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Invariant violations
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by the LLM service itself.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl CodebookError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Transient failures worth retrying: timeouts, rate limits, connection
    /// problems and server-side (5xx) errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            Self::Api(ApiError::Status { status, .. }) => *status >= 500,
            _ => false,
        }
    }

    /// Retry delay hint in seconds, if the service supplied one.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Result type alias for codebook.
pub type Result<T> = std::result::Result<T, CodebookError>;

/// A per-item failure, carried on a `ClassificationResult` instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemError {
    /// The response named a label outside the vocabulary.
    InvalidLabel { label: String },
    /// The response could not be parsed into the shape the mode requires.
    MalformedResponse { message: String },
    /// The service call failed and the retry ceiling was reached (or the error was terminal).
    Service { message: String, attempts: u32 },
    /// The batch service reported an error for this line.
    Remote { code: Option<String>, message: String },
    /// The job completed but returned no line for this external id.
    MissingResult,
    /// The worker processing this item panicked.
    WorkerPanicked { message: String },
}

impl ItemError {
    /// Stable category name, used for logging and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidLabel { .. } => "invalid_label",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::Service { .. } => "service",
            Self::Remote { .. } => "remote",
            Self::MissingResult => "missing_result",
            Self::WorkerPanicked { .. } => "worker_panicked",
        }
    }

    /// Convert a validator failure into a per-item error.
    ///
    /// Anything other than a label or shape violation is folded into `MalformedResponse`.
    pub fn from_validation(err: CodebookError) -> Self {
        match err {
            CodebookError::InvalidLabel { label, .. } => Self::InvalidLabel { label },
            CodebookError::MalformedResponse(message)
            | CodebookError::Api(ApiError::InvalidResponse(message)) => {
                Self::MalformedResponse { message }
            }
            other => Self::MalformedResponse {
                message: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLabel { label } => write!(f, "invalid label '{label}'"),
            Self::MalformedResponse { message } => write!(f, "malformed response: {message}"),
            Self::Service { message, attempts } => {
                write!(f, "service error after {attempts} attempt(s): {message}")
            }
            Self::Remote { code, message } => match code {
                Some(code) => write!(f, "remote error [{code}]: {message}"),
                None => write!(f, "remote error: {message}"),
            },
            Self::MissingResult => write!(f, "missing result"),
            Self::WorkerPanicked { message } => write!(f, "worker panicked: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CodebookError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            CodebookError::RateLimited {
                retry_after_secs: 2.0
            }
            .is_retryable()
        );
        assert!(
            CodebookError::Api(ApiError::Status {
                status: 503,
                message: "overloaded".into()
            })
            .is_retryable()
        );
        assert!(
            !CodebookError::Api(ApiError::Status {
                status: 400,
                message: "bad request".into()
            })
            .is_retryable()
        );
        assert!(!CodebookError::Api(ApiError::AuthenticationFailed).is_retryable());
        assert!(!CodebookError::Validation("empty".into()).is_retryable());
    }

    #[test]
    fn test_item_error_serializes_with_kind_tag() {
        let err = ItemError::InvalidLabel {
            label: "Happy".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "invalid_label");
        assert_eq!(json["label"], "Happy");

        let missing = serde_json::to_value(ItemError::MissingResult).unwrap();
        assert_eq!(missing["kind"], "missing_result");
    }

    #[test]
    fn test_from_validation_keeps_label() {
        let err = CodebookError::InvalidLabel {
            label: "Happy".into(),
            allowed: vec!["positive".into()],
        };
        assert_eq!(
            ItemError::from_validation(err),
            ItemError::InvalidLabel {
                label: "Happy".into()
            }
        );
    }
}
