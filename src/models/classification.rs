//! Classification types for codebook.
//!
//! These types carry the core data flow: a `LabelSet` and `TextItem`s go in,
//! `ClassificationRequest`s are built once, and each one ends as exactly one
//! `ClassificationResult`.

use super::{CodebookError, ItemError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// How responses are constrained against the vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelMode {
    /// Exactly one label from the vocabulary.
    Single,
    /// Zero or more distinct labels from the vocabulary.
    Multi,
    /// Free keyword extraction, no vocabulary.
    #[serde(alias = "keywords", alias = "keyword")]
    Open,
}

impl LabelMode {
    /// Whether responses must come from a closed vocabulary.
    pub fn is_closed(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl std::fmt::Display for LabelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelMode::Single => write!(f, "single"),
            LabelMode::Multi => write!(f, "multi"),
            LabelMode::Open => write!(f, "open"),
        }
    }
}

impl std::str::FromStr for LabelMode {
    type Err = CodebookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single_label" | "single-label" => Ok(Self::Single),
            "multi" | "multi_label" | "multi-label" => Ok(Self::Multi),
            "open" | "keyword" | "keywords" | "keyword_extraction" => Ok(Self::Open),
            other => Err(CodebookError::Validation(format!(
                "unknown label mode '{other}' (expected single, multi or open)"
            ))),
        }
    }
}

/// Ordered, case-sensitive vocabulary of permissible labels.
///
/// Invariants: labels are unique and non-empty; single and multi modes carry at
/// least one label. Open mode may carry an empty vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelSet {
    mode: LabelMode,
    labels: Vec<String>,
}

impl LabelSet {
    /// Build a label set, enforcing the vocabulary invariants.
    pub fn new<I, S>(mode: LabelMode, labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();

        if mode.is_closed() && labels.is_empty() {
            return Err(CodebookError::Validation(format!(
                "label set for {mode} mode must not be empty"
            )));
        }

        let mut seen = HashSet::with_capacity(labels.len());
        for label in &labels {
            if label.trim().is_empty() {
                return Err(CodebookError::Validation(
                    "labels must be non-empty strings".to_string(),
                ));
            }
            if !seen.insert(label.as_str()) {
                return Err(CodebookError::Validation(format!(
                    "duplicate label '{label}'"
                )));
            }
        }

        Ok(Self { mode, labels })
    }

    /// Label set for open keyword extraction.
    pub fn open() -> Self {
        Self {
            mode: LabelMode::Open,
            labels: Vec::new(),
        }
    }

    pub fn mode(&self) -> LabelMode {
        self.mode
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Exact, case-sensitive membership.
    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// One input text, as handed over by an import collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub text: String,

    /// Caller-supplied id, used to re-join against a reference dataset.
    #[serde(default, alias = "id", alias = "custom_id", skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    /// Existing reference label, kept for later reliability comparison.
    #[serde(default, alias = "label", skip_serializing_if = "Option::is_none")]
    pub reference_label: Option<String>,
}

impl TextItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            external_id: None,
            reference_label: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_reference_label(mut self, label: impl Into<String>) -> Self {
        self.reference_label = Some(label.into());
        self
    }
}

/// A single classification request bound to a stable external id.
///
/// Created once by the request builder and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRequest {
    pub external_id: String,
    pub text: String,
    pub label_set: Arc<LabelSet>,
}

/// Outcome of classifying one request: either validated labels or a per-item error.
///
/// Field order is the stable export order: external_id, text, assigned_labels, error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub external_id: String,
    pub text: String,
    #[serde(default)]
    pub assigned_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ClassificationResult {
    /// A validated result.
    pub fn success(
        request: &ClassificationRequest,
        assigned_labels: Vec<String>,
        raw_response: String,
    ) -> Self {
        Self {
            external_id: request.external_id.clone(),
            text: request.text.clone(),
            assigned_labels,
            error: None,
            raw_response: Some(raw_response),
        }
    }

    /// A per-item failure. `raw_response` is kept when the service did answer.
    pub fn failure(
        request: &ClassificationRequest,
        error: ItemError,
        raw_response: Option<String>,
    ) -> Self {
        Self {
            external_id: request.external_id.clone(),
            text: request.text.clone(),
            assigned_labels: Vec::new(),
            error: Some(error),
            raw_response,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
