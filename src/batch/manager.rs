//! Batch job manager.
//!
//! Submission, refresh, retrieval and cancellation are each one round-trip to
//! the service. The manager never polls on its own: callers decide when to
//! `refresh` (see `batch.poll_interval_secs`).

use super::job::{BatchJob, JobState};
use super::manifest::{
    BATCH_ENDPOINT, FailedRequest, assemble_results, decode_manifest, encode_manifest,
    parse_error_lines,
};
use crate::client::{BatchErrorDetail, BatchService, RemoteBatch, RequestCounts};
use crate::models::{
    ClassificationRequest, ClassificationResult, CodebookError, Config, ItemError, ModelConfig,
    Result,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remote statuses reported as still running by `list`.
const ONGOING_STATUSES: &[&str] = &["validating", "in_progress", "cancelling", "finalizing"];

/// One entry of `BatchManager::list`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub job_id: String,
    pub status: String,
    pub state: Option<JobState>,
    pub ongoing: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub request_counts: Option<RequestCounts>,
}

impl From<RemoteBatch> for BatchSummary {
    fn from(remote: RemoteBatch) -> Self {
        Self {
            ongoing: ONGOING_STATUSES.contains(&remote.status.as_str()),
            state: JobState::from_remote(&remote.status),
            created_at: remote
                .created_at
                .and_then(|s| DateTime::from_timestamp(s, 0)),
            request_counts: remote.request_counts,
            job_id: remote.id,
            status: remote.status,
        }
    }
}

/// Why a FAILED job failed.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub job_id: String,
    pub remote_status: Option<String>,
    /// Job-level errors, such as a manifest the service rejected
    pub errors: Vec<BatchErrorDetail>,
    /// Per-request failures from the error file
    pub failed_requests: Vec<FailedRequest>,
    /// Error file as downloaded, if the service produced one
    #[serde(skip)]
    pub raw_error_file: Option<String>,
}

/// Drives batch jobs against a `BatchService`.
pub struct BatchManager {
    service: Arc<dyn BatchService>,
    model: ModelConfig,
    completion_window: String,
}

impl BatchManager {
    pub fn new(
        service: Arc<dyn BatchService>,
        model: ModelConfig,
        completion_window: impl Into<String>,
    ) -> Self {
        Self {
            service,
            model,
            completion_window: completion_window.into(),
        }
    }

    pub fn from_config(service: Arc<dyn BatchService>, config: &Config) -> Self {
        Self::new(
            service,
            config.model.clone(),
            config.batch.completion_window.clone(),
        )
    }

    /// Serialize, upload and create a job. Returns without waiting for completion.
    pub async fn submit(&self, requests: Vec<ClassificationRequest>) -> Result<BatchJob> {
        if requests.is_empty() {
            return Err(CodebookError::Validation(
                "cannot submit an empty manifest".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(requests.len());
        if let Some(dup) = requests
            .iter()
            .find(|r| !seen.insert(r.external_id.as_str()))
        {
            return Err(CodebookError::Validation(format!(
                "duplicate external id '{}' in manifest",
                dup.external_id
            )));
        }

        let manifest = encode_manifest(&requests, &self.model)?;
        let filename = format!("codebook-{}.jsonl", Utc::now().format("%Y%m%dT%H%M%S"));
        debug!(
            filename = %filename,
            lines = requests.len(),
            bytes = manifest.len(),
            "Uploading manifest"
        );

        let input_file_id = self
            .service
            .upload_file(&filename, manifest.into_bytes())
            .await?;
        let remote = self
            .service
            .create_batch(&input_file_id, BATCH_ENDPOINT, &self.completion_window)
            .await?;

        let mut job = BatchJob::from_id(remote.id.clone());
        job.manifest = requests;
        job.input_file_id = Some(input_file_id);
        job.created_at = Some(Utc::now());
        // Accepted by the service: at least VALIDATING until it reports otherwise.
        job.state = JobState::Validating;
        job.apply_remote(&remote);

        info!(
            job_id = %job.job_id,
            items = job.manifest.len(),
            model = %self.model.id,
            state = %job.state,
            "Batch job submitted"
        );
        Ok(job)
    }

    /// Overwrite the cached state with the service's. Safe to repeat.
    pub async fn refresh(&self, job: &mut BatchJob) -> Result<JobState> {
        let remote = self.service.retrieve_batch(&job.job_id).await?;
        let before = job.state;
        job.apply_remote(&remote);

        if before != job.state {
            info!(job_id = %job.job_id, from = %before, to = %job.state, "Batch job state changed");
        } else {
            debug!(job_id = %job.job_id, state = %job.state, "Batch job refreshed");
        }
        Ok(job.state)
    }

    /// Rebuild a job handle from its id alone.
    pub async fn reconnect(&self, job_id: &str) -> Result<BatchJob> {
        let mut job = BatchJob::from_id(job_id);
        self.refresh(&mut job).await?;
        info!(job_id, state = %job.state, "Reconnected to batch job");
        Ok(job)
    }

    /// Download and validate results: one entry per manifest request.
    ///
    /// Only valid once the job is COMPLETED. A reconnected job has its
    /// manifest rebuilt from the uploaded input file first.
    pub async fn retrieve(&self, job: &mut BatchJob) -> Result<Vec<ClassificationResult>> {
        if job.state != JobState::Completed {
            return Err(CodebookError::JobState {
                job_id: job.job_id.clone(),
                operation: "retrieve",
                state: job.state.to_string(),
            });
        }

        if job.manifest.is_empty() {
            let input_file_id = job.input_file_id.clone().ok_or_else(|| {
                CodebookError::Internal(format!("job {} has no input file", job.job_id))
            })?;
            let content = self.service.file_content(&input_file_id).await?;
            job.manifest = decode_manifest(&content)?;
            debug!(job_id = %job.job_id, items = job.manifest.len(), "Manifest rebuilt from input file");
        }

        let output = match &job.result_file_ref {
            Some(file_id) => self.service.file_content(file_id).await?,
            None => {
                warn!(job_id = %job.job_id, "Completed job has no output file");
                String::new()
            }
        };
        let errors = match &job.error_file_ref {
            Some(file_id) => self.service.file_content(file_id).await?,
            None => String::new(),
        };

        let results = assemble_results(&job.manifest, &[&output, &errors]);

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let missing = results
            .iter()
            .filter(|r| matches!(r.error, Some(ItemError::MissingResult)))
            .count();
        if missing > 0 {
            warn!(job_id = %job.job_id, missing, "Results missing for some requests");
        }
        info!(
            job_id = %job.job_id,
            total = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            "Batch results retrieved"
        );
        Ok(results)
    }

    /// Collect the reasons a FAILED job gave: job-level errors plus every
    /// line of its error file.
    pub async fn failure_report(&self, job: &BatchJob) -> Result<FailureReport> {
        if job.state != JobState::Failed {
            return Err(CodebookError::JobState {
                job_id: job.job_id.clone(),
                operation: "failure_report",
                state: job.state.to_string(),
            });
        }

        let raw_error_file = match &job.error_file_ref {
            Some(file_id) => Some(self.service.file_content(file_id).await?),
            None => None,
        };
        let failed_requests = raw_error_file
            .as_deref()
            .map(parse_error_lines)
            .unwrap_or_default();

        info!(
            job_id = %job.job_id,
            job_errors = job.errors.len(),
            failed_requests = failed_requests.len(),
            "Batch failure report built"
        );
        Ok(FailureReport {
            job_id: job.job_id.clone(),
            remote_status: job.remote_status.clone(),
            errors: job.errors.clone(),
            failed_requests,
            raw_error_file,
        })
    }

    /// Request cancellation.
    ///
    /// A job already in a terminal state is left alone and its state returned.
    /// The job moves to CANCELLING; a later `refresh` observes CANCELLED.
    pub async fn cancel(&self, job: &mut BatchJob) -> Result<JobState> {
        if job.state.is_terminal() {
            info!(job_id = %job.job_id, state = %job.state, "Job already finished, nothing to cancel");
            return Ok(job.state);
        }
        if !job.state.is_cancellable() {
            return Err(CodebookError::JobState {
                job_id: job.job_id.clone(),
                operation: "cancel",
                state: job.state.to_string(),
            });
        }

        let remote = self.service.cancel_batch(&job.job_id).await?;
        job.apply_remote(&remote);
        if !job.state.is_terminal() {
            job.state = JobState::Cancelling;
        }

        info!(job_id = %job.job_id, state = %job.state, "Cancellation requested");
        Ok(job.state)
    }

    /// Recent jobs on the account, newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<BatchSummary>> {
        let batches = self.service.list_batches(limit).await?;
        Ok(batches.into_iter().map(BatchSummary::from).collect())
    }
}
