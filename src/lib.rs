//! codebook - LLM text classification against a fixed label vocabulary,
//! with inter-rater reliability statistics.
//!
//! ## Architecture
//!
//! - **Request builder** (`classify`): label set + texts → requests with stable external ids
//! - **Validator** (`classify`): raw LLM output → vocabulary-constrained labels
//! - **Live engine** (`pool`): bounded worker pool with retry, cancellation and progress
//! - **Batch manager** (`batch`): JSONL manifest, remote job lifecycle, result reassembly
//! - **Reliability** (`reliability`): percent agreement, Cohen's kappa, confusion matrix
//!
//! Both execution paths route responses through the same validator and yield
//! one `ClassificationResult` per request. Per-item failures are data on the
//! result; structural failures abort the operation that raised them.

pub mod batch;
pub mod classify;
pub mod client;
pub mod dataset;
pub mod models;
pub mod pool;
pub mod reliability;
pub mod store;

// Re-exports for convenience
pub use batch::{BatchJob, BatchManager, JobState};
pub use classify::{build_requests, validate_response};
pub use client::{BatchService, ClassificationService, LLMClient, RateLimiter};
pub use models::{
    ClassificationRequest, ClassificationResult, CodebookError, Config, ItemError, LabelMode,
    LabelSet, Result, TextItem,
};
pub use pool::{CancelFlag, LiveEngine, LiveRun, LiveSettings};
pub use reliability::{ReliabilityReport, compute_reliability};
pub use store::{JobRecord, JobStore};
