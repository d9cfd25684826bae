//! LLM client for OpenAI-compatible endpoints.
//!
//! Covers the two surfaces codebook uses:
//! - `/chat/completions` with a strict `json_schema` response format (live mode)
//! - `/files` and `/batches` (batch mode)
//!
//! Each call is a single attempt. Retry policy lives in `LiveEngine`, and the
//! batch manager surfaces failures to its caller.

use crate::classify::{build_messages, response_format};
use crate::client::{BatchService, ClassificationService, RateLimiter, RemoteBatch};
use crate::models::{ApiError, ClassificationRequest, CodebookError, Config, ModelConfig, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Route key the rate limiter uses for file uploads and downloads.
const FILES_ROUTE: &str = "files";
/// Route key for the batch job endpoints.
const BATCHES_ROUTE: &str = "batches";

/// Message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
///
/// Also used verbatim as the `body` of each batch manifest line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub response_format: serde_json::Value,
}

impl ChatCompletionBody {
    pub fn for_request(model: &ModelConfig, request: &ClassificationRequest) -> Self {
        Self {
            model: model.id.clone(),
            messages: build_messages(&request.label_set, &request.text),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            response_format: response_format(&request.label_set),
        }
    }
}

/// Chat completion response. Batch result lines carry the same shape in `response.body`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub refusal: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl ChatCompletionResponse {
    /// Text of the first choice. A refusal is reported as malformed output.
    pub fn into_content(self) -> Result<String> {
        let message = self
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| CodebookError::MalformedResponse("no choices in response".into()))?;

        match (message.content, message.refusal) {
            (Some(content), _) => Ok(content),
            (None, Some(refusal)) => Err(CodebookError::MalformedResponse(format!(
                "model refused: {refusal}"
            ))),
            (None, None) => Err(CodebookError::MalformedResponse(
                "empty message content".into(),
            )),
        }
    }
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchList {
    #[serde(default)]
    data: Vec<RemoteBatch>,
}

#[derive(Debug, Serialize)]
struct CreateBatchBody<'a> {
    input_file_id: &'a str,
    endpoint: &'a str,
    completion_window: &'a str,
}

/// Token usage observed by a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Client for an OpenAI-compatible endpoint.
pub struct LLMClient {
    client: reqwest::Client,
    api_key: Option<String>,
    organization: Option<String>,
    base_url: String,
    timeout: Duration,
    model: ModelConfig,
    rate_limiter: Arc<RateLimiter>,
    // Usage tracking
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_prompt_tokens: AtomicU64,
    total_completion_tokens: AtomicU64,
}

impl LLMClient {
    /// Create a new client.
    ///
    /// `api_key` may be `None` for local endpoints without auth.
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout_secs: u64,
        model: ModelConfig,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CodebookError::Network)?;

        Ok(Self {
            client,
            api_key,
            organization: None,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            model,
            rate_limiter: rate_limiter.unwrap_or_default(),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_prompt_tokens: AtomicU64::new(0),
            total_completion_tokens: AtomicU64::new(0),
        })
    }

    /// Build a client from loaded configuration, resolving the API key.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let mut client = Self::new(
            Some(api_key),
            config.service.base_url.clone(),
            config.service.timeout_secs,
            config.model.clone(),
            None,
        )?;
        client.organization = config.service.organization.clone();
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn usage(&self) -> UsageSnapshot {
        UsageSnapshot {
            requests: self.total_requests.load(Ordering::Relaxed),
            errors: self.total_errors.load(Ordering::Relaxed),
            prompt_tokens: self.total_prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.total_completion_tokens.load(Ordering::Relaxed),
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Some(org) = &self.organization {
            if let Ok(value) = HeaderValue::from_str(org) {
                headers.insert("OpenAI-Organization", value);
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send a prepared request, recording it with the rate limiter and
    /// mapping transport failures and non-2xx statuses to `CodebookError`.
    async fn send(
        &self,
        route: &str,
        what: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        self.rate_limiter.wait_if_needed(route).await;
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let response = request.headers(self.headers()).send().await.map_err(|e| {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            if e.is_timeout() {
                CodebookError::Timeout(self.timeout)
            } else {
                CodebookError::Network(e)
            }
        })?;

        let status = response.status().as_u16();
        self.rate_limiter
            .record_response(route, status, response.headers());

        if response.status().is_success() {
            return Ok(response);
        }

        self.total_errors.fetch_add(1, Ordering::Relaxed);
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<f64>().ok());
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);

        debug!(route, status, %message, "Service returned an error");

        Err(match status {
            429 => CodebookError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(1.0),
            },
            408 => CodebookError::Timeout(self.timeout),
            401 => ApiError::AuthenticationFailed.into(),
            404 => ApiError::NotFound(what.to_string()).into(),
            _ => ApiError::Status { status, message }.into(),
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            ApiError::InvalidResponse(format!("failed to parse service response: {e}")).into()
        })
    }

    fn record_usage(&self, usage: Option<ChatUsage>) {
        if let Some(usage) = usage {
            self.total_prompt_tokens
                .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
            self.total_completion_tokens
                .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl ClassificationService for LLMClient {
    async fn classify(&self, request: &ClassificationRequest) -> Result<String> {
        let body = ChatCompletionBody::for_request(&self.model, request);
        let builder = self.client.post(self.url("/chat/completions")).json(&body);

        let response = self
            .send(&self.model.id, &format!("model {}", self.model.id), builder)
            .await?;
        let completion: ChatCompletionResponse = Self::json(response).await?;
        self.record_usage(completion.usage);

        debug!(external_id = %request.external_id, "Completion received");
        completion.into_content()
    }
}

#[async_trait]
impl BatchService for LLMClient {
    async fn upload_file(&self, filename: &str, content: Vec<u8>) -> Result<String> {
        let part = Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str("application/jsonl")?;
        let form = Form::new().text("purpose", "batch").part("file", part);
        let builder = self.client.post(self.url("/files")).multipart(form);

        let response = self.send(FILES_ROUTE, "files endpoint", builder).await?;
        let file: FileObject = Self::json(response).await?;
        Ok(file.id)
    }

    async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: &str,
        completion_window: &str,
    ) -> Result<RemoteBatch> {
        let builder = self.client.post(self.url("/batches")).json(&CreateBatchBody {
            input_file_id,
            endpoint,
            completion_window,
        });
        let response = self.send(BATCHES_ROUTE, "batches endpoint", builder).await?;
        Self::json(response).await
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch> {
        let builder = self.client.get(self.url(&format!("/batches/{batch_id}")));
        let response = self
            .send(BATCHES_ROUTE, &format!("batch {batch_id}"), builder)
            .await?;
        Self::json(response).await
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<RemoteBatch> {
        let builder = self
            .client
            .post(self.url(&format!("/batches/{batch_id}/cancel")));
        let response = self
            .send(BATCHES_ROUTE, &format!("batch {batch_id}"), builder)
            .await?;
        Self::json(response).await
    }

    async fn file_content(&self, file_id: &str) -> Result<String> {
        let builder = self.client.get(self.url(&format!("/files/{file_id}/content")));
        let response = self
            .send(FILES_ROUTE, &format!("file {file_id}"), builder)
            .await?;
        Ok(response.text().await?)
    }

    async fn list_batches(&self, limit: usize) -> Result<Vec<RemoteBatch>> {
        let builder = self
            .client
            .get(self.url("/batches"))
            .query(&[("limit", limit)]);
        let response = self.send(BATCHES_ROUTE, "batches endpoint", builder).await?;
        let list: BatchList = Self::json(response).await?;
        Ok(list.data)
    }
}
