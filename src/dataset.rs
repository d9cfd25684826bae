//! File import and export for the CLI.
//!
//! The core works on in-memory label lists, text items and results; this
//! module turns files into those shapes and writes results back out.

use crate::models::{ClassificationResult, CodebookError, Result, TextItem};
use crate::reliability::{LabeledDataset, LabeledText, ReliabilityReport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

fn is_jsonl(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jsonl" | "ndjson")
    )
}

/// Display name for a dataset file.
pub fn dataset_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_lines(path: &Path, what: &str) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| CodebookError::io(format!("opening {what} file"), e))?;
    BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| CodebookError::io(format!("reading {what} file"), e))
}

fn read_jsonl<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    for (line_num, line) in read_lines(path, what)?.into_iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line).map_err(|e| {
            CodebookError::ParseError(format!("{}: line {}: {e}", path.display(), line_num + 1))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Load a label vocabulary: a JSON array, or one label per line
/// (blank lines and `#` comments ignored).
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let labels: Vec<String> = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let file =
            File::open(path).map_err(|e| CodebookError::io("opening labels file", e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            CodebookError::ParseError(format!("{}: expected a JSON array of strings: {e}", path.display()))
        })?
    } else {
        read_lines(path, "labels")?
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect()
    };

    info!(count = labels.len(), "Loaded labels");
    Ok(labels)
}

/// Load texts: JSONL objects (`text`, optional `id`, optional `label`) or
/// plain text with one item per non-blank line.
pub fn load_texts(path: &Path) -> Result<Vec<TextItem>> {
    let items = if is_jsonl(path) {
        read_jsonl::<TextItem>(path, "texts")?
    } else {
        read_lines(path, "texts")?
            .into_iter()
            .filter(|l| !l.trim().is_empty())
            .map(TextItem::new)
            .collect()
    };

    info!(count = items.len(), "Loaded texts");
    Ok(items)
}

/// A labeled row as found in exported results or reference files.
#[derive(Debug, Deserialize)]
struct LabeledLine {
    text: String,
    #[serde(default, alias = "reference_label")]
    label: Option<String>,
    #[serde(default)]
    assigned_labels: Option<Vec<String>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Load a labeled dataset for reliability comparison.
///
/// Accepts reference rows (`text`, `label`) and exported results
/// (`text`, `assigned_labels`). Rows carrying an error or neither field are
/// skipped. An empty `assigned_labels` (a multi-label result choosing
/// nothing) is kept as the empty label, as `LabeledText::from_results` does.
pub fn load_labeled(path: &Path) -> Result<LabeledDataset> {
    let lines: Vec<LabeledLine> = read_jsonl(path, "labeled dataset")?;
    let total = lines.len();

    let rows: Vec<LabeledText> = lines
        .into_iter()
        .filter(|l| l.error.as_ref().is_none_or(|e| e.is_null()))
        .filter_map(|l| {
            let label = match (l.label, l.assigned_labels) {
                (Some(label), _) => label,
                (None, Some(labels)) => labels.join("; "),
                (None, None) => return None,
            };
            Some(LabeledText::new(l.text, label))
        })
        .collect();

    if rows.len() < total {
        warn!(
            path = %path.display(),
            skipped = total - rows.len(),
            "Skipped rows without a usable label"
        );
    }

    Ok(LabeledDataset::new(dataset_name(path), rows))
}

/// Write results as JSONL in stable field order.
pub fn write_results(path: &Path, results: &[ClassificationResult]) -> Result<()> {
    let file = File::create(path).map_err(|e| CodebookError::io("creating results file", e))?;
    let mut writer = BufWriter::new(file);
    for result in results {
        let line = serde_json::to_string(result)
            .map_err(|e| CodebookError::Internal(format!("Serializing result: {e}")))?;
        writeln!(writer, "{line}").map_err(|e| CodebookError::io("writing results file", e))?;
    }
    writer
        .flush()
        .map_err(|e| CodebookError::io("flushing results file", e))?;

    info!(path = %path.display(), count = results.len(), "Results written");
    Ok(())
}

/// Write any serializable value as pretty JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).map_err(|e| CodebookError::io("creating JSON file", e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| CodebookError::Internal(format!("Serializing {}: {e}", path.display())))?;
    writer
        .flush()
        .map_err(|e| CodebookError::io("flushing JSON file", e))?;
    info!(path = %path.display(), "JSON written");
    Ok(())
}

/// Write a reliability report as pretty JSON.
pub fn write_report(path: &Path, report: &ReliabilityReport) -> Result<()> {
    write_json(path, report)
}

/// How much of a dataset to keep when sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleSize {
    /// A fixed number of rows, clamped to the dataset size
    Rows(usize),
    /// A share of the dataset, clamped to 0..=100 and rounded to whole rows
    Percent(f64),
}

impl SampleSize {
    /// Number of rows to draw from `len`.
    pub fn count(self, len: usize) -> usize {
        match self {
            SampleSize::Rows(n) => n.min(len),
            SampleSize::Percent(pct) => {
                let pct = if pct.is_nan() { 0.0 } else { pct.clamp(0.0, 100.0) };
                ((pct / 100.0 * len as f64).round() as usize).min(len)
            }
        }
    }
}

/// Draw a random subset without replacement. Kept rows stay in input order.
pub fn sample<T: Clone, R: Rng + ?Sized>(items: &[T], size: SampleSize, rng: &mut R) -> Vec<T> {
    let amount = size.count(items.len());
    let mut picked = rand::seq::index::sample(rng, items.len(), amount).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| items[i].clone()).collect()
}

/// Sample the non-blank lines of a texts file into a new file of the same
/// format. A seed makes the draw reproducible.
pub fn sample_file(input: &Path, output: &Path, size: SampleSize, seed: Option<u64>) -> Result<usize> {
    let lines: Vec<String> = read_lines(input, "texts")?
        .into_iter()
        .filter(|l| !l.trim().is_empty())
        .collect();

    let kept = match seed {
        Some(seed) => sample(&lines, size, &mut StdRng::seed_from_u64(seed)),
        None => sample(&lines, size, &mut rand::thread_rng()),
    };

    let file = File::create(output).map_err(|e| CodebookError::io("creating sample file", e))?;
    let mut writer = BufWriter::new(file);
    for line in &kept {
        writeln!(writer, "{line}").map_err(|e| CodebookError::io("writing sample file", e))?;
    }
    writer
        .flush()
        .map_err(|e| CodebookError::io("flushing sample file", e))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        total = lines.len(),
        kept = kept.len(),
        "Sample written"
    );
    Ok(kept.len())
}
