//! Configuration models for codebook.
//!
//! Every tunable (service endpoint, model, pool size, retry ceiling, batch
//! window) is loaded from a TOML file with serde defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for codebook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// LLM service endpoint and credentials
    #[serde(default)]
    pub service: ServiceConfig,

    /// Model used for both live and batch classification
    #[serde(default)]
    pub model: ModelConfig,

    /// Live (synchronous) classification settings
    #[serde(default)]
    pub live: LiveConfig,

    /// Batch job settings
    #[serde(default)]
    pub batch: BatchConfig,
}

/// OpenAI-compatible service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// API key (can also be set via the env var named by `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Optional organization header
    #[serde(default)]
    pub organization: Option<String>,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            organization: None,
        }
    }
}

/// Model parameters sent with every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model ID (e.g. "gpt-4o-mini")
    #[serde(default = "default_model_id")]
    pub id: String,

    #[serde(default)]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Live classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Maximum in-flight requests
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry ceiling for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds, doubled per attempt
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound on any single backoff delay
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_concurrency() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    30
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

/// Batch job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Completion window requested from the service
    #[serde(default = "default_completion_window")]
    pub completion_window: String,

    /// Suggested interval between `refresh` calls when polling.
    /// The manager never polls on its own.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Number of jobs returned by `batch list`
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,

    /// Directory holding the persisted job status store
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_completion_window() -> String {
    "24h".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_list_limit() -> usize {
    20
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".codebook")
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            completion_window: default_completion_window(),
            poll_interval_secs: default_poll_interval(),
            list_limit: default_list_limit(),
            store_dir: default_store_dir(),
        }
    }
}

const VALID_COMPLETION_WINDOWS: &[&str] = &["24h"];

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=300).contains(&self.service.timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "service.timeout_secs must be between 1 and 300, got {}",
                self.service.timeout_secs
            )));
        }
        if self.live.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "live.concurrency must be at least 1".to_string(),
            ));
        }
        if self.live.max_retries > 10 {
            return Err(ConfigError::Invalid(format!(
                "live.max_retries must be between 0 and 10, got {}",
                self.live.max_retries
            )));
        }
        if !VALID_COMPLETION_WINDOWS.contains(&self.batch.completion_window.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "batch.completion_window '{}' is not supported (expected one of: {})",
                self.batch.completion_window,
                VALID_COMPLETION_WINDOWS.join(", ")
            )));
        }
        if self.model.id.trim().is_empty() {
            return Err(ConfigError::Invalid("model.id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Resolve API key from config or environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.service.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.service.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.service.api_key_env.clone(),
        })
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    re.replace_all(s, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| cap[0].to_string())
    })
    .into_owned()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or service.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.service.base_url, "https://api.openai.com/v1");
        assert_eq!(config.service.timeout_secs, 60);
        assert_eq!(config.live.concurrency, 8);
        assert_eq!(config.live.max_retries, 3);
        assert_eq!(config.batch.completion_window, "24h");
        assert_eq!(config.batch.poll_interval_secs, 60);
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let config = Config::from_toml(
            r#"
            [model]
            id = "gpt-4o"

            [live]
            concurrency = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.model.id, "gpt-4o");
        assert_eq!(config.model.max_tokens, 512);
        assert_eq!(config.live.concurrency, 3);
        assert_eq!(config.live.base_backoff_ms, 500);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(matches!(
            Config::from_toml("[live]\nmax_retries = 11"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("[live]\nconcurrency = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("[service]\ntimeout_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("[batch]\ncompletion_window = \"2h\""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let config = Config::from_toml("[service]\napi_key = \"sk-inline\"").unwrap();
        assert_eq!(config.resolve_api_key().unwrap(), "sk-inline");
    }

    #[test]
    fn test_missing_api_key_names_env_var() {
        let config =
            Config::from_toml("[service]\napi_key_env = \"CODEBOOK_TEST_UNSET_KEY_VAR\"").unwrap();
        match config.resolve_api_key() {
            Err(ConfigError::MissingApiKey { env_var }) => {
                assert_eq!(env_var, "CODEBOOK_TEST_UNSET_KEY_VAR")
            }
            other => panic!("expected MissingApiKey, got {other:?}"),
        }
    }

    #[test]
    fn test_unset_placeholder_left_unchanged() {
        assert_eq!(
            expand_env_vars("${CODEBOOK_TEST_SURELY_UNSET}-suffix"),
            "${CODEBOOK_TEST_SURELY_UNSET}-suffix"
        );
    }

    #[test]
    fn test_from_file_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[live\nconcurrency = 2").unwrap();
        match Config::from_file(file.path()) {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
