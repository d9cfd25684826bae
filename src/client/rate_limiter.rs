//! Adaptive rate limiter for the LLM service.
//!
//! The service advertises its remaining budget in `x-ratelimit-*` response
//! headers. We track those per route (model id for completions, `files` and
//! `batches` for the job API) and hold requests back once a budget is spent.

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on the backoff applied after consecutive 429s.
const MAX_THROTTLE_SECS: f64 = 60.0;
/// Reset hints further out than this are treated as this.
const MAX_RESET_SECS: f64 = 24.0 * 3600.0;

/// Header-supplied seconds as a duration, capped at `max`. Negative and NaN
/// values yield `None`.
fn bounded_secs(secs: f64, max: f64) -> Option<Duration> {
    if secs.is_nan() {
        return None;
    }
    Duration::try_from_secs_f64(secs.min(max)).ok()
}

/// A request or token allowance that refills at `reset_at`.
#[derive(Debug, Default, Clone, Copy)]
struct Allowance {
    remaining: Option<u64>,
    reset_at: Option<Instant>,
}

impl Allowance {
    fn exhausted_for(&self, now: Instant) -> Duration {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) if reset_at > now => reset_at - now,
            _ => Duration::ZERO,
        }
    }

    fn update(&mut self, headers: &HeaderMap, remaining_key: &str, reset_key: &str, now: Instant) {
        if let Some(remaining) = header_str(headers, remaining_key).and_then(|s| s.parse().ok()) {
            self.remaining = Some(remaining);
        }
        if let Some(wait) = header_str(headers, reset_key)
            .and_then(parse_reset)
            .and_then(|secs| bounded_secs(secs, MAX_RESET_SECS))
        {
            self.reset_at = Some(now + wait);
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key)?.to_str().ok()
}

/// Reset hints come as plain seconds (`"1.5"`) or with a unit suffix (`"6m0s"`, `"250ms"`).
fn parse_reset(value: &str) -> Option<f64> {
    if let Ok(secs) = value.parse::<f64>() {
        return Some(secs);
    }
    let mut total = 0.0;
    let mut number = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let n: f64 = number.parse().ok()?;
        number.clear();
        total += match c {
            'h' => n * 3600.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                n / 1000.0
            }
            'm' => n * 60.0,
            's' => n,
            _ => return None,
        };
    }
    number.is_empty().then_some(total)
}

/// Throttle state for one route.
#[derive(Debug, Default)]
struct RouteState {
    requests: Allowance,
    tokens: Allowance,
    consecutive_429s: u32,
    throttled_until: Option<Instant>,
}

impl RouteState {
    fn wait_time(&self, now: Instant) -> Duration {
        let throttle = self
            .throttled_until
            .filter(|&t| t > now)
            .map_or(Duration::ZERO, |t| t - now);
        throttle
            .max(self.requests.exhausted_for(now))
            .max(self.tokens.exhausted_for(now))
    }

    fn record_429(&mut self, retry_after: Option<f64>) {
        self.consecutive_429s = self.consecutive_429s.saturating_add(1);
        let backoff = retry_after
            .and_then(|secs| bounded_secs(secs, MAX_THROTTLE_SECS))
            .unwrap_or_else(|| {
                let exp = 2f64.powi(self.consecutive_429s.min(16) as i32);
                Duration::from_secs_f64(exp.min(MAX_THROTTLE_SECS))
            });
        self.throttled_until = Some(Instant::now() + backoff);
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs = backoff.as_secs_f64(),
            "Rate limited (429), throttling route"
        );
    }

    fn record_success(&mut self) {
        self.consecutive_429s = 0;
        self.throttled_until = None;
    }
}

/// Shared, per-route rate limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    routes: DashMap<String, RouteState>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until `route` has budget again. Returns the time waited.
    pub async fn wait_if_needed(&self, route: &str) -> Duration {
        let wait = self
            .routes
            .get(route)
            .map_or(Duration::ZERO, |state| state.wait_time(Instant::now()));

        if !wait.is_zero() {
            debug!(route, wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record a response for `route`.
    pub fn record_response(&self, route: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.routes.entry(route.to_string()).or_default();

        state.requests.update(
            headers,
            "x-ratelimit-remaining-requests",
            "x-ratelimit-reset-requests",
            now,
        );
        state.tokens.update(
            headers,
            "x-ratelimit-remaining-tokens",
            "x-ratelimit-reset-tokens",
            now,
        );

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            let retry_after = header_str(headers, "retry-after").and_then(|s| s.parse().ok());
            state.record_429(retry_after);
        } else if status < 400 {
            state.record_success();
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_429s = self.total_429s.load(Ordering::Relaxed);
        RateLimiterStats {
            total_requests,
            total_429s,
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            routes_tracked: self.routes.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
    pub routes_tracked: usize,
}
