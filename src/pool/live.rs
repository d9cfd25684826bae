//! Live classification engine.
//!
//! Requests run through a fixed-size pool: the dispatcher takes a semaphore
//! permit before spawning each task, so at most `concurrency` calls are ever
//! in flight and cancellation stops dispatch at the next permit. Every
//! dispatched request yields exactly one `ClassificationResult`.

use crate::classify::validate_response;
use crate::client::ClassificationService;
use crate::models::{
    ApiError, ClassificationRequest, ClassificationResult, CodebookError, ItemError, LiveConfig,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pool size and retry policy for a live run.
#[derive(Debug, Clone, Copy)]
pub struct LiveSettings {
    /// Maximum in-flight requests
    pub concurrency: usize,
    /// Retries after the first attempt, for transient failures only
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self::from(&LiveConfig::default())
    }
}

impl From<&LiveConfig> for LiveSettings {
    fn from(config: &LiveConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

impl LiveSettings {
    /// Delay before retry number `retry` (zero-based).
    ///
    /// A service retry-after hint wins over the exponential schedule. Both are
    /// capped at `max_backoff`.
    pub fn backoff(&self, retry: u32, retry_after: Option<f64>) -> Duration {
        let hint = retry_after
            .filter(|secs| !secs.is_nan())
            .and_then(|secs| Duration::try_from_secs_f64(secs.min(self.max_backoff.as_secs_f64())).ok());
        let delay = hint.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
            self.base_backoff.saturating_mul(factor)
        });
        delay.min(self.max_backoff)
    }
}

/// Cooperative cancellation signal shared between a caller and a running engine.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One event per finished request.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveProgress {
    pub completed: usize,
    pub total: usize,
    pub external_id: String,
    pub ok: bool,
}

/// Outcome of a live run.
#[derive(Debug, Clone, Serialize)]
pub struct LiveRun {
    pub run_id: Uuid,
    /// One entry per dispatched request, in input order.
    pub results: Vec<ClassificationResult>,
    pub total: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub runtime_secs: f64,
}

/// Bounded-concurrency executor for classification requests.
pub struct LiveEngine {
    service: Arc<dyn ClassificationService>,
    settings: LiveSettings,
    semaphore: Arc<Semaphore>,
}

impl LiveEngine {
    pub fn new(service: Arc<dyn ClassificationService>, settings: LiveSettings) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            service,
            settings,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn settings(&self) -> &LiveSettings {
        &self.settings
    }

    /// Classify every request, isolating per-item failures.
    ///
    /// When `cancel` is raised, in-flight requests finish, nothing new is
    /// dispatched and the results gathered so far are returned.
    pub async fn run(
        &self,
        requests: Vec<ClassificationRequest>,
        cancel: &CancelFlag,
        progress: Option<mpsc::UnboundedSender<LiveProgress>>,
    ) -> LiveRun {
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let total = requests.len();
        let completed = Arc::new(AtomicUsize::new(0));

        info!(
            %run_id,
            total,
            concurrency = self.settings.concurrency,
            max_retries = self.settings.max_retries,
            "Starting live run"
        );

        let mut handles = Vec::with_capacity(total);

        for request in requests {
            if cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                warn!(%run_id, "Worker pool closed, stopping dispatch");
                break;
            };
            // Re-check: the flag may have been raised while waiting for a slot.
            if cancel.is_cancelled() {
                break;
            }

            let service = Arc::clone(&self.service);
            let settings = self.settings;
            let completed = Arc::clone(&completed);
            let progress = progress.clone();
            let task_request = request.clone();

            let handle = tokio::spawn(async move {
                let result = classify_with_retry(service.as_ref(), &settings, &task_request).await;
                drop(permit);
                report(&progress, &completed, total, &result);
                result
            });
            handles.push((request, handle));
        }

        let dispatched = handles.len();
        let mut results = Vec::with_capacity(dispatched);

        for (request, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(%run_id, external_id = %request.external_id, error = %e, "Worker panicked");
                    let result = ClassificationResult::failure(
                        &request,
                        ItemError::WorkerPanicked {
                            message: e.to_string(),
                        },
                        None,
                    );
                    report(&progress, &completed, total, &result);
                    result
                }
            };
            results.push(result);
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        let cancelled = cancel.is_cancelled() && dispatched < total;
        let runtime_secs = start.elapsed().as_secs_f64();

        info!(
            %run_id,
            dispatched,
            succeeded,
            failed,
            cancelled,
            runtime_secs,
            "Live run finished"
        );

        LiveRun {
            run_id,
            results,
            total,
            dispatched,
            succeeded,
            failed,
            cancelled,
            runtime_secs,
        }
    }
}

fn report(
    progress: &Option<mpsc::UnboundedSender<LiveProgress>>,
    completed: &AtomicUsize,
    total: usize,
    result: &ClassificationResult,
) {
    let completed = completed.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(tx) = progress {
        // A dropped receiver just means nobody is watching.
        let _ = tx.send(LiveProgress {
            completed,
            total,
            external_id: result.external_id.clone(),
            ok: result.is_success(),
        });
    }
}

/// Send, retry transient failures, validate.
async fn classify_with_retry(
    service: &dyn ClassificationService,
    settings: &LiveSettings,
    request: &ClassificationRequest,
) -> ClassificationResult {
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match service.classify(request).await {
            Ok(raw) => {
                return match validate_response(&raw, &request.label_set) {
                    Ok(labels) => ClassificationResult::success(request, labels, raw),
                    Err(e) => {
                        warn!(external_id = %request.external_id, error = %e, "Response rejected");
                        ClassificationResult::failure(request, ItemError::from_validation(e), Some(raw))
                    }
                };
            }
            Err(e) if e.is_retryable() && attempts <= settings.max_retries => {
                let delay = settings.backoff(attempts - 1, e.retry_after());
                debug!(
                    external_id = %request.external_id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            // The service answered, but with nothing usable: same outcome
            // as a batch line carrying that answer.
            Err(
                e @ (CodebookError::MalformedResponse(_)
                | CodebookError::Api(ApiError::InvalidResponse(_))),
            ) => {
                warn!(external_id = %request.external_id, error = %e, "Response rejected");
                return ClassificationResult::failure(request, ItemError::from_validation(e), None);
            }
            Err(e) => {
                warn!(
                    external_id = %request.external_id,
                    attempts,
                    error = %e,
                    "Request failed"
                );
                return ClassificationResult::failure(
                    request,
                    ItemError::Service {
                        message: e.to_string(),
                        attempts,
                    },
                    None,
                );
            }
        }
    }
}
