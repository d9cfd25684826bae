//! Batch job lifecycle.
//!
//! ```text
//! CREATED → VALIDATING → IN_PROGRESS → COMPLETED (T)
//!                                     → FAILED (T)
//!                      → CANCELLING → CANCELLED (T)
//! VALIDATING → FAILED (T)
//! ```
//!
//! The remote service owns the state. A `BatchJob` is a local cache that only
//! `BatchManager::refresh` advances.

use crate::client::{BatchErrorDetail, RemoteBatch, RequestCounts};
use crate::models::ClassificationRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lifecycle state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Validating,
    InProgress,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl JobState {
    /// Map a remote status string. Unknown statuses map to `None`.
    pub fn from_remote(status: &str) -> Option<Self> {
        match status {
            "validating" => Some(Self::Validating),
            "in_progress" | "finalizing" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" | "expired" => Some(Self::Failed),
            "cancelling" => Some(Self::Cancelling),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States from which cancellation may be requested.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Created | Self::Validating | Self::InProgress)
    }

    /// Whether the lifecycle graph has a path from `self` to `next`.
    ///
    /// Polling can skip intermediate states, so reachability rather than a
    /// single edge is what matters.
    pub fn can_reach(self, next: JobState) -> bool {
        use JobState::*;
        if self == next {
            return true;
        }
        match self {
            Created => next != Created,
            Validating => matches!(next, InProgress | Completed | Failed | Cancelling | Cancelled),
            InProgress => matches!(next, Completed | Failed | Cancelling | Cancelled),
            Cancelling => next == Cancelled,
            Completed | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Created => "CREATED",
            JobState::Validating => "VALIDATING",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelling => "CANCELLING",
            JobState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Local handle on a remote batch job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    pub job_id: String,
    /// Submitted requests in manifest order. Empty after a reconnect until
    /// `retrieve` rebuilds it from the uploaded input file.
    #[serde(skip)]
    pub manifest: Vec<ClassificationRequest>,
    pub state: JobState,
    /// Raw status last reported by the service
    pub remote_status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_file_id: Option<String>,
    pub result_file_ref: Option<String>,
    pub error_file_ref: Option<String>,
    pub request_counts: Option<RequestCounts>,
    /// Job-level errors reported by the service
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<BatchErrorDetail>,
}

impl BatchJob {
    /// A job known only by id, as after a restart.
    pub fn from_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            manifest: Vec::new(),
            state: JobState::Created,
            remote_status: None,
            created_at: None,
            completed_at: None,
            input_file_id: None,
            result_file_ref: None,
            error_file_ref: None,
            request_counts: None,
            errors: Vec::new(),
        }
    }

    /// Overwrite cached fields with what the service reports.
    pub fn apply_remote(&mut self, remote: &RemoteBatch) {
        match JobState::from_remote(&remote.status) {
            Some(next) => {
                if !self.state.can_reach(next) {
                    warn!(
                        job_id = %self.job_id,
                        from = %self.state,
                        to = %next,
                        "Unexpected batch state transition reported by service"
                    );
                }
                self.state = next;
            }
            None => warn!(
                job_id = %self.job_id,
                status = %remote.status,
                "Unknown batch status, keeping cached state"
            ),
        }

        self.remote_status = Some(remote.status.clone());
        if remote.input_file_id.is_some() {
            self.input_file_id = remote.input_file_id.clone();
        }
        if remote.output_file_id.is_some() {
            self.result_file_ref = remote.output_file_id.clone();
        }
        if remote.error_file_id.is_some() {
            self.error_file_ref = remote.error_file_id.clone();
        }
        if let Some(ts) = remote.created_at.and_then(|s| DateTime::from_timestamp(s, 0)) {
            self.created_at = Some(ts);
        }
        if let Some(ts) = remote.completed_at.and_then(|s| DateTime::from_timestamp(s, 0)) {
            self.completed_at = Some(ts);
        }
        if remote.request_counts.is_some() {
            self.request_counts = remote.request_counts;
        }
        if let Some(errors) = &remote.errors {
            self.errors = errors.data.clone();
        }
    }
}
