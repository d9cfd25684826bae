//! Percent agreement and Cohen's kappa over two labeled datasets.
//!
//! Pure and synchronous: the report is recomputed from scratch on every call.

use crate::models::{ClassificationResult, CodebookError, Result};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Chance agreement this close to 1 makes kappa 0/0.
const PE_EPSILON: f64 = 1e-12;

/// One (text, label) pair from a labeler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledText {
    pub text: String,
    pub label: String,
}

impl LabeledText {
    pub fn new(text: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            label: label.into(),
        }
    }

    /// Adapt classification results. Errored items are skipped and
    /// multi-label assignments are joined with `"; "`.
    pub fn from_results(results: &[ClassificationResult]) -> Vec<Self> {
        results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| Self::new(r.text.clone(), r.assigned_labels.join("; ")))
            .collect()
    }
}

/// A named collection of labeled texts.
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    pub name: String,
    pub rows: Vec<LabeledText>,
}

impl LabeledDataset {
    pub fn new(name: impl Into<String>, rows: Vec<LabeledText>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }
}

/// Counts per (label_a, label_b) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfusionMatrix(BTreeMap<(String, String), usize>);

impl ConfusionMatrix {
    fn record(&mut self, label_a: &str, label_b: &str) {
        *self
            .0
            .entry((label_a.to_string(), label_b.to_string()))
            .or_insert(0) += 1;
    }

    /// Count for a pair; zero if never observed.
    pub fn get(&self, label_a: &str, label_b: &str) -> usize {
        self.0
            .get(&(label_a.to_string(), label_b.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, usize)> {
        self.0
            .iter()
            .map(|((a, b), n)| (a.as_str(), b.as_str(), *n))
    }

    /// Number of distinct observed pairs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

/// How `ConfusionMatrix::normalized` scales its counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalize {
    /// Raw counts
    #[default]
    None,
    /// Each non-empty row sums to 1
    Row,
    /// Each non-empty column sums to 1
    Col,
    /// The whole matrix sums to 1
    All,
}

impl std::fmt::Display for Normalize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Normalize::None => "none",
            Normalize::Row => "row",
            Normalize::Col => "col",
            Normalize::All => "all",
        })
    }
}

impl std::str::FromStr for Normalize {
    type Err = CodebookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "row" | "rows" => Ok(Self::Row),
            "col" | "cols" | "column" | "columns" => Ok(Self::Col),
            "all" => Ok(Self::All),
            other => Err(CodebookError::Validation(format!(
                "unknown normalization '{other}' (expected none, row, col or all)"
            ))),
        }
    }
}

/// Dense view of a confusion matrix: rows are dataset A's labels, columns
/// dataset B's, both sorted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedMatrix {
    pub normalize: Normalize,
    pub zero_diag: bool,
    pub rows: Vec<String>,
    pub cols: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl NormalizedMatrix {
    pub fn get(&self, label_a: &str, label_b: &str) -> f64 {
        let row = self.rows.iter().position(|l| l == label_a);
        let col = self.cols.iter().position(|l| l == label_b);
        match (row, col) {
            (Some(r), Some(c)) => self.values[r][c],
            _ => 0.0,
        }
    }
}

impl ConfusionMatrix {
    /// Dense, optionally normalized view.
    ///
    /// With `zero_diag`, cells where both labels match are cleared before
    /// normalizing. Rows or columns that sum to zero stay zero.
    pub fn normalized(&self, normalize: Normalize, zero_diag: bool) -> NormalizedMatrix {
        let rows: Vec<String> = self
            .0
            .keys()
            .map(|(a, _)| a.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let cols: Vec<String> = self
            .0
            .keys()
            .map(|(_, b)| b.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut values: Vec<Vec<f64>> = rows
            .iter()
            .map(|a| {
                cols.iter()
                    .map(|b| {
                        if zero_diag && a == b {
                            0.0
                        } else {
                            self.get(a, b) as f64
                        }
                    })
                    .collect()
            })
            .collect();

        let nonzero = |sum: f64| if sum == 0.0 { 1.0 } else { sum };
        match normalize {
            Normalize::None => {}
            Normalize::Row => {
                for row in &mut values {
                    let sum = nonzero(row.iter().sum());
                    row.iter_mut().for_each(|v| *v /= sum);
                }
            }
            Normalize::Col => {
                for c in 0..cols.len() {
                    let sum = nonzero(values.iter().map(|row| row[c]).sum());
                    values.iter_mut().for_each(|row| row[c] /= sum);
                }
            }
            Normalize::All => {
                let total = nonzero(values.iter().flatten().sum());
                values.iter_mut().flatten().for_each(|v| *v /= total);
            }
        }

        NormalizedMatrix {
            normalize,
            zero_diag,
            rows,
            cols,
            values,
        }
    }
}

#[derive(Serialize)]
struct Cell<'a> {
    label_a: &'a str,
    label_b: &'a str,
    count: usize,
}

impl Serialize for ConfusionMatrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(|(label_a, label_b, count)| Cell {
            label_a,
            label_b,
            count,
        }))
    }
}

/// A matched row of the inner join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinedRow {
    pub text: String,
    pub label_a: String,
    pub label_b: String,
    pub agreement: bool,
}

/// Agreement statistics between two datasets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityReport {
    pub dataset_a_name: String,
    pub dataset_b_name: String,
    pub joined_row_count: usize,
    /// 0..=100
    pub percent_agreement: f64,
    pub cohens_kappa: f64,
    pub confusion_matrix: ConfusionMatrix,
    /// Sorted union of labels seen in either dataset's matched rows
    pub labels: Vec<String>,
    pub rows: Vec<JoinedRow>,
}

/// Inner join on exact text. A text occurring k times in A and m times in B
/// yields k×m rows, in A's order and then B's.
pub fn join_on_text(a: &[LabeledText], b: &[LabeledText]) -> Vec<JoinedRow> {
    let mut by_text: HashMap<&str, Vec<&str>> = HashMap::new();
    for row in b {
        by_text.entry(row.text.as_str()).or_default().push(&row.label);
    }

    let mut joined = Vec::new();
    for row in a {
        if let Some(labels_b) = by_text.get(row.text.as_str()) {
            for label_b in labels_b {
                joined.push(JoinedRow {
                    text: row.text.clone(),
                    label_a: row.label.clone(),
                    label_b: (*label_b).to_string(),
                    agreement: row.label == *label_b,
                });
            }
        }
    }
    joined
}

/// Cohen's kappa from observed (`po`) and chance (`pe`) agreement.
///
/// When `pe` is 1 kappa is 0/0: it is 1.0 if `po` is also 1, otherwise an error.
pub fn cohens_kappa(po: f64, pe: f64) -> Result<f64> {
    if (1.0 - pe).abs() < PE_EPSILON {
        if (1.0 - po).abs() < PE_EPSILON {
            return Ok(1.0);
        }
        return Err(CodebookError::UndefinedKappa {
            observed_agreement: po,
        });
    }
    Ok((po - pe) / (1.0 - pe))
}

/// Join two datasets on text and compute agreement statistics.
pub fn compute_reliability(a: &LabeledDataset, b: &LabeledDataset) -> Result<ReliabilityReport> {
    let rows = join_on_text(&a.rows, &b.rows);
    if rows.is_empty() {
        return Err(CodebookError::NoOverlap {
            dataset_a: a.name.clone(),
            dataset_b: b.name.clone(),
        });
    }

    let n = rows.len() as f64;
    let mut matrix = ConfusionMatrix::default();
    let mut freq_a: HashMap<&str, usize> = HashMap::new();
    let mut freq_b: HashMap<&str, usize> = HashMap::new();
    let mut labels = BTreeSet::new();
    let mut agreements = 0usize;

    for row in &rows {
        matrix.record(&row.label_a, &row.label_b);
        *freq_a.entry(&row.label_a).or_insert(0) += 1;
        *freq_b.entry(&row.label_b).or_insert(0) += 1;
        labels.insert(row.label_a.as_str());
        labels.insert(row.label_b.as_str());
        if row.agreement {
            agreements += 1;
        }
    }

    let po = agreements as f64 / n;
    let pe: f64 = labels
        .iter()
        .map(|label| {
            let pa = freq_a.get(label).copied().unwrap_or(0) as f64 / n;
            let pb = freq_b.get(label).copied().unwrap_or(0) as f64 / n;
            pa * pb
        })
        .sum();
    let kappa = cohens_kappa(po, pe)?;
    let labels: Vec<String> = labels.into_iter().map(str::to_string).collect();

    Ok(ReliabilityReport {
        dataset_a_name: a.name.clone(),
        dataset_b_name: b.name.clone(),
        joined_row_count: rows.len(),
        percent_agreement: po * 100.0,
        cohens_kappa: kappa,
        confusion_matrix: matrix,
        labels,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClassificationRequest, ItemError, LabelMode, LabelSet};
    use std::sync::Arc;

    fn dataset(name: &str, rows: &[(&str, &str)]) -> LabeledDataset {
        LabeledDataset::new(
            name,
            rows.iter().map(|(t, l)| LabeledText::new(*t, *l)).collect(),
        )
    }

    #[test]
    fn test_three_row_scenario() {
        let a = dataset("model", &[("t1", "pos"), ("t2", "neg"), ("t3", "neu")]);
        let b = dataset("human", &[("t1", "pos"), ("t2", "pos"), ("t3", "neu")]);
        let report = compute_reliability(&a, &b).unwrap();

        assert_eq!(report.joined_row_count, 3);
        assert!((report.percent_agreement - 66.67).abs() < 0.01);
        assert_eq!(report.confusion_matrix.get("pos", "pos"), 1);
        assert_eq!(report.confusion_matrix.get("neg", "pos"), 1);
        assert_eq!(report.confusion_matrix.get("neu", "neu"), 1);
        assert_eq!(report.confusion_matrix.len(), 3);
        assert_eq!(report.confusion_matrix.total(), 3);
        assert_eq!(report.labels, ["neg", "neu", "pos"]);

        // po = 2/3, pe = (1/3)(2/3) + (1/3)(0) + (1/3)(1/3) = 1/3
        assert!((report.cohens_kappa - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_identical_datasets_agree_perfectly() {
        let rows = [("a", "x"), ("b", "y"), ("c", "x"), ("d", "z")];
        let report = compute_reliability(&dataset("a", &rows), &dataset("b", &rows)).unwrap();
        assert_eq!(report.percent_agreement, 100.0);
        assert!((report.cohens_kappa - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_identical_labels_give_kappa_one() {
        let rows = [("a", "pos"), ("b", "pos")];
        let report = compute_reliability(&dataset("a", &rows), &dataset("b", &rows)).unwrap();
        assert_eq!(report.cohens_kappa, 1.0);
    }

    #[test]
    fn test_full_disagreement() {
        let a = dataset("a", &[("t1", "positive"), ("t2", "positive")]);
        let b = dataset("b", &[("t1", "negative"), ("t2", "negative")]);
        let report = compute_reliability(&a, &b).unwrap();
        assert_eq!(report.percent_agreement, 0.0);
        assert!(report.cohens_kappa <= 0.0);

        let a = dataset("a", &[("t1", "positive"), ("t2", "negative")]);
        let b = dataset("b", &[("t1", "negative"), ("t2", "positive")]);
        let report = compute_reliability(&a, &b).unwrap();
        assert_eq!(report.percent_agreement, 0.0);
        assert!((report.cohens_kappa + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_overlap_is_an_error() {
        let a = dataset("a", &[("t1", "pos")]);
        let b = dataset("b", &[("t2", "pos")]);
        assert!(matches!(
            compute_reliability(&a, &b),
            Err(CodebookError::NoOverlap { .. })
        ));
    }

    #[test]
    fn test_undefined_kappa_branch() {
        assert!(matches!(
            cohens_kappa(0.5, 1.0),
            Err(CodebookError::UndefinedKappa { .. })
        ));
        assert_eq!(cohens_kappa(1.0, 1.0).unwrap(), 1.0);
    }

    #[test]
    fn test_swapping_datasets_transposes_matrix() {
        let a = dataset("a", &[("t1", "pos"), ("t2", "neg"), ("t3", "neu")]);
        let b = dataset("b", &[("t1", "pos"), ("t2", "pos"), ("t3", "neu")]);
        let ab = compute_reliability(&a, &b).unwrap();
        let ba = compute_reliability(&b, &a).unwrap();

        assert_eq!(ab.percent_agreement, ba.percent_agreement);
        assert!((ab.cohens_kappa - ba.cohens_kappa).abs() < 1e-12);
        assert_eq!(ba.confusion_matrix.get("pos", "neg"), 1);
        assert_eq!(ba.dataset_a_name, "b");
    }

    #[test]
    fn test_duplicate_texts_join_as_cross_product() {
        let a = dataset("a", &[("t", "x"), ("t", "y")]);
        let b = dataset("b", &[("t", "x"), ("t", "x"), ("u", "x")]);
        let rows = join_on_text(&a.rows, &b.rows);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows.iter().filter(|r| r.agreement).count(), 2);
    }

    #[test]
    fn test_from_results_skips_errors_and_joins_multi() {
        let set = Arc::new(LabelSet::new(LabelMode::Multi, ["a", "b"]).unwrap());
        let req = |id: &str, text: &str| ClassificationRequest {
            external_id: id.into(),
            text: text.into(),
            label_set: Arc::clone(&set),
        };
        let results = vec![
            ClassificationResult::success(&req("1", "one"), vec!["a".into(), "b".into()], String::new()),
            ClassificationResult::failure(&req("2", "two"), ItemError::MissingResult, None),
        ];
        let rows = LabeledText::from_results(&results);
        assert_eq!(rows, vec![LabeledText::new("one", "a; b")]);
    }

    fn skewed() -> ConfusionMatrix {
        let a = dataset("a", &[("t1", "pos"), ("t2", "pos"), ("t3", "neg"), ("t4", "pos")]);
        let b = dataset("b", &[("t1", "pos"), ("t2", "neg"), ("t3", "neg"), ("t4", "neu")]);
        compute_reliability(&a, &b).unwrap().confusion_matrix
    }

    fn close(x: f64, y: f64) -> bool {
        (x - y).abs() < 1e-9
    }

    #[test]
    fn test_normalized_axes_are_sorted_labels() {
        let view = skewed().normalized(Normalize::None, false);
        assert_eq!(view.rows, ["neg", "pos"]);
        assert_eq!(view.cols, ["neg", "neu", "pos"]);
        assert_eq!(view.values, vec![vec![1.0, 0.0, 0.0], vec![1.0, 1.0, 1.0]]);
        assert_eq!(view.get("pos", "neu"), 1.0);
        assert_eq!(view.get("missing", "neu"), 0.0);
    }

    #[test]
    fn test_row_normalization_sums_rows_to_one() {
        let view = skewed().normalized(Normalize::Row, false);
        for row in &view.values {
            assert!(close(row.iter().sum(), 1.0));
        }
        assert!(close(view.get("pos", "pos"), 1.0 / 3.0));
    }

    #[test]
    fn test_col_normalization_sums_cols_to_one() {
        let view = skewed().normalized(Normalize::Col, false);
        for c in 0..view.cols.len() {
            assert!(close(view.values.iter().map(|r| r[c]).sum(), 1.0));
        }
        assert!(close(view.get("neg", "neg"), 0.5));
    }

    #[test]
    fn test_all_normalization_sums_to_one() {
        let view = skewed().normalized(Normalize::All, false);
        assert!(close(view.values.iter().flatten().sum(), 1.0));
        assert!(close(view.get("pos", "neg"), 0.25));
    }

    #[test]
    fn test_zero_diag_applies_before_normalizing() {
        let view = skewed().normalized(Normalize::Row, true);
        assert_eq!(view.get("neg", "neg"), 0.0);
        assert_eq!(view.get("pos", "pos"), 0.0);
        // The "neg" row is empty once its diagonal is cleared and stays zero.
        assert_eq!(view.values[0], vec![0.0, 0.0, 0.0]);
        assert!(close(view.get("pos", "neg"), 0.5));
        assert!(close(view.get("pos", "neu"), 0.5));
    }

    #[test]
    fn test_normalize_parses_names() {
        assert_eq!("row".parse::<Normalize>().unwrap(), Normalize::Row);
        assert_eq!("Columns".parse::<Normalize>().unwrap(), Normalize::Col);
        assert!("diagonal".parse::<Normalize>().is_err());
        assert_eq!(Normalize::All.to_string(), "all");
    }

    #[test]
    fn test_matrix_serializes_as_cells() {
        let a = dataset("a", &[("t1", "pos")]);
        let report = compute_reliability(&a, &a).unwrap();
        let json = serde_json::to_value(&report.confusion_matrix).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"label_a": "pos", "label_b": "pos", "count": 1}])
        );
    }
}
