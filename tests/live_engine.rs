use async_trait::async_trait;
use codebook::classify::build_requests_from_texts;
use codebook::client::ClassificationService;
use codebook::models::{
    ApiError, ClassificationRequest, CodebookError, ItemError, LabelMode, LabelSet, Result,
};
use codebook::pool::{CancelFlag, LiveEngine, LiveSettings};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Behaviour is keyed on the request text.
#[derive(Default)]
struct ScriptedService {
    attempts: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl ScriptedService {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn attempts(&self, text: &str) -> u32 {
        self.attempts.lock().unwrap().get(text).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ClassificationService for ScriptedService {
    async fn classify(&self, request: &ClassificationRequest) -> Result<String> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(request.text.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match request.text.as_str() {
            "flaky" if attempt <= 2 => Err(CodebookError::Timeout(Duration::from_secs(1))),
            "throttled" if attempt == 1 => Err(CodebookError::RateLimited {
                retry_after_secs: 0.001,
            }),
            "overloaded" => Err(CodebookError::Api(ApiError::Status {
                status: 503,
                message: "overloaded".into(),
            })),
            "unauthorized" => Err(CodebookError::Api(ApiError::AuthenticationFailed)),
            "off-vocabulary" => Ok("Happy".to_string()),
            "garbled" => Ok("[\"positive\", \"negative\"]".to_string()),
            "explode" => panic!("worker blew up"),
            "refused" => Err(CodebookError::MalformedResponse("model refused: no".into())),
            _ => Ok(r#"{"label": "positive"}"#.to_string()),
        }
    }
}

fn sentiment() -> Arc<LabelSet> {
    Arc::new(LabelSet::new(LabelMode::Single, ["positive", "negative", "neutral"]).unwrap())
}

fn fast_settings(concurrency: usize) -> LiveSettings {
    LiveSettings {
        concurrency,
        max_retries: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn every_request_yields_exactly_one_result_despite_failures() {
    let texts = [
        "fine",
        "flaky",
        "throttled",
        "overloaded",
        "unauthorized",
        "off-vocabulary",
        "garbled",
        "explode",
        "also fine",
    ];
    let requests = build_requests_from_texts(sentiment(), &texts).unwrap();
    let service = Arc::new(ScriptedService::default());
    let engine = LiveEngine::new(service.clone(), fast_settings(3));

    let run = engine.run(requests, &CancelFlag::new(), None).await;

    assert_eq!(run.results.len(), texts.len());
    assert_eq!(run.dispatched, texts.len());
    assert!(!run.cancelled);
    let ids: HashSet<_> = run.results.iter().map(|r| r.external_id.as_str()).collect();
    assert_eq!(ids.len(), texts.len());

    let by_text: HashMap<_, _> = run
        .results
        .iter()
        .map(|r| (r.text.as_str(), r))
        .collect();

    assert_eq!(by_text["fine"].assigned_labels, vec!["positive"]);
    assert_eq!(by_text["flaky"].assigned_labels, vec!["positive"]);
    assert_eq!(service.attempts("flaky"), 3);
    assert!(by_text["throttled"].is_success());

    assert_eq!(
        by_text["overloaded"].error,
        Some(ItemError::Service {
            message: "LLM service error: API error (status 503): overloaded".into(),
            attempts: 4,
        })
    );
    assert_eq!(service.attempts("overloaded"), 4);

    assert!(matches!(
        by_text["unauthorized"].error,
        Some(ItemError::Service { attempts: 1, .. })
    ));
    assert_eq!(service.attempts("unauthorized"), 1);

    assert_eq!(
        by_text["off-vocabulary"].error,
        Some(ItemError::InvalidLabel {
            label: "Happy".into()
        })
    );
    assert_eq!(by_text["off-vocabulary"].raw_response.as_deref(), Some("Happy"));
    assert!(matches!(
        by_text["garbled"].error,
        Some(ItemError::MalformedResponse { .. })
    ));
    assert!(matches!(
        by_text["explode"].error,
        Some(ItemError::WorkerPanicked { .. })
    ));

    assert_eq!(run.succeeded, 4);
    assert_eq!(run.failed, 5);
}

#[tokio::test]
async fn refusal_is_recorded_as_malformed_without_retry() {
    let requests = build_requests_from_texts(sentiment(), &["refused"]).unwrap();
    let service = Arc::new(ScriptedService::default());
    let engine = LiveEngine::new(service.clone(), fast_settings(1));

    let run = engine.run(requests, &CancelFlag::new(), None).await;

    assert_eq!(
        run.results[0].error,
        Some(ItemError::MalformedResponse {
            message: "model refused: no".into()
        })
    );
    assert_eq!(service.attempts("refused"), 1);
}

#[tokio::test]
async fn results_keep_input_order() {
    let texts: Vec<String> = (0..20).map(|i| format!("text {i}")).collect();
    let requests = build_requests_from_texts(sentiment(), &texts).unwrap();
    let engine = LiveEngine::new(Arc::new(ScriptedService::default()), fast_settings(4));

    let run = engine.run(requests, &CancelFlag::new(), None).await;
    let got: Vec<_> = run.results.iter().map(|r| r.text.clone()).collect();
    assert_eq!(got, texts);
}

#[tokio::test]
async fn pool_bounds_in_flight_requests() {
    let texts: Vec<String> = (0..12).map(|i| format!("item {i}")).collect();
    let requests = build_requests_from_texts(sentiment(), &texts).unwrap();
    let service = Arc::new(ScriptedService::with_delay(Duration::from_millis(10)));
    let engine = LiveEngine::new(service.clone(), fast_settings(3));

    let run = engine.run(requests, &CancelFlag::new(), None).await;
    assert_eq!(run.results.len(), 12);
    assert!(service.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn progress_reports_one_event_per_request() {
    let texts = ["a", "b", "off-vocabulary", "d"];
    let requests = build_requests_from_texts(sentiment(), &texts).unwrap();
    let engine = LiveEngine::new(Arc::new(ScriptedService::default()), fast_settings(2));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = engine.run(requests, &CancelFlag::new(), Some(tx)).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), run.results.len());
    assert_eq!(events.iter().filter(|e| !e.ok).count(), 1);
    assert!(events.iter().all(|e| e.total == 4));
    let mut completed: Vec<_> = events.iter().map(|e| e.completed).collect();
    completed.sort_unstable();
    assert_eq!(completed, [1, 2, 3, 4]);
}

#[tokio::test]
async fn cancellation_drains_in_flight_and_keeps_partial_results() {
    let texts: Vec<String> = (0..10).map(|i| format!("quote {i}")).collect();
    let requests = build_requests_from_texts(sentiment(), &texts).unwrap();
    let service = Arc::new(ScriptedService::with_delay(Duration::from_millis(20)));
    let engine = LiveEngine::new(service.clone(), fast_settings(3));

    let cancel = CancelFlag::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = async {
        let mut seen = 0usize;
        while rx.recv().await.is_some() {
            seen += 1;
            if seen == 4 {
                cancel.cancel();
            }
        }
        seen
    };

    let (run, seen) = tokio::join!(engine.run(requests, &cancel, Some(tx)), watcher);

    assert!((4..=10).contains(&run.results.len()));
    assert_eq!(run.results.len(), run.dispatched);
    assert_eq!(seen, run.dispatched);
    assert_eq!(run.cancelled, run.dispatched < 10);

    let ids: HashSet<_> = run.results.iter().map(|r| r.external_id.as_str()).collect();
    assert_eq!(ids.len(), run.results.len());
    assert!(run.results.iter().all(|r| r.is_success()));
}

#[tokio::test]
async fn pre_cancelled_run_dispatches_nothing() {
    let requests = build_requests_from_texts(sentiment(), &["a", "b"]).unwrap();
    let service = Arc::new(ScriptedService::default());
    let engine = LiveEngine::new(service.clone(), fast_settings(2));

    let cancel = CancelFlag::new();
    cancel.cancel();
    let run = engine.run(requests, &cancel, None).await;

    assert!(run.results.is_empty());
    assert!(run.cancelled);
    assert_eq!(service.attempts("a"), 0);
}
