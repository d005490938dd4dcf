//! Evaluation of a detector against a labelled before/after test set.
//!
//! A test set directory holds three sibling folders sharing file stems:
//!
//! ```text
//! test/
//!   A/      before images  (<id>.png)
//!   B/      after images   (<id>.png)
//!   label/  change masks   (<id>.png)
//! ```
//!
//! A pair counts as truly changed when its label mask has a mean intensity
//! above 10; it counts as predicted changed when the detector's confidence
//! clears its threshold.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::detector::MiningDetector;
use crate::error::{Error, Result};
use crate::model::ChangeModel;
use crate::types::Severity;

/// Mean label intensity above which a pair has real change.
pub const LABEL_CHANGE_MEAN: f32 = 10.0;

const CLASS_NAMES: [&str; 2] = ["No Change", "Change"];

/// Ground truth for one label mask.
pub fn label_has_change(label: &image::GrayImage) -> bool {
    let pixels = label.as_raw();
    if pixels.is_empty() {
        return false;
    }
    let sum: u64 = pixels.iter().map(|&v| v as u64).sum();
    (sum as f64 / pixels.len() as f64) > LABEL_CHANGE_MEAN as f64
}

/// Decode a label mask from disk and apply [`label_has_change`].
pub fn load_label(path: &Path) -> Result<bool> {
    let label = image::open(path)
        .map_err(|source| Error::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .into_luma8();
    Ok(label_has_change(&label))
}

/// Binary confusion matrix, "change" being the positive class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_positives: usize,
}

/// Precision / recall / F1 for one class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub support: usize,
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

impl ConfusionMatrix {
    pub fn record(&mut self, truth: bool, predicted: bool) {
        match (truth, predicted) {
            (false, false) => self.true_negatives += 1,
            (false, true) => self.false_positives += 1,
            (true, false) => self.false_negatives += 1,
            (true, true) => self.true_positives += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.true_negatives + self.false_positives + self.false_negatives + self.true_positives
    }

    pub fn positives(&self) -> usize {
        self.true_positives + self.false_negatives
    }

    pub fn negatives(&self) -> usize {
        self.true_negatives + self.false_positives
    }

    pub fn accuracy(&self) -> f32 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    /// Metrics for the "change" class (`true`) or the "no change" class.
    pub fn class_metrics(&self, change: bool) -> ClassMetrics {
        let (hits, false_alarms, misses) = if change {
            (self.true_positives, self.false_positives, self.false_negatives)
        } else {
            (self.true_negatives, self.false_negatives, self.false_positives)
        };
        let precision = ratio(hits, hits + false_alarms);
        let recall = ratio(hits, hits + misses);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        ClassMetrics {
            precision,
            recall,
            f1,
            support: hits + misses,
        }
    }
}

/// Counts laid out with actual classes as rows and predictions as columns.
impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>18} {:>19} {:>19}",
            "", "Predicted No Change", "Predicted Change"
        )?;
        writeln!(
            f,
            "{:>18} {:>19} {:>19}",
            "Actual No Change", self.true_negatives, self.false_positives
        )?;
        writeln!(
            f,
            "{:>18} {:>19} {:>19}",
            "Actual Change", self.false_negatives, self.true_positives
        )
    }
}

fn weighted_mean(classes: &[ClassMetrics], weights: &[f32], pick: fn(&ClassMetrics) -> f32) -> f32 {
    let total: f32 = weights.iter().sum();
    if total == 0.0 {
        return 0.0;
    }
    classes.iter().zip(weights).map(|(c, w)| pick(c) * w).sum::<f32>() / total
}

/// Per-class table in the familiar precision / recall / f1 / support layout.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationReport {
    pub matrix: ConfusionMatrix,
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.matrix;
        let classes = [m.class_metrics(false), m.class_metrics(true)];
        let total = m.total();

        writeln!(
            f,
            "{:>12} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for (name, c) in CLASS_NAMES.iter().zip(&classes) {
            writeln!(
                f,
                "{:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                name, c.precision, c.recall, c.f1, c.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>12} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy",
            "",
            "",
            m.accuracy(),
            total
        )?;

        let weights = [1.0f32; 2];
        let supports = classes.map(|c| c.support as f32);
        for (name, w) in [("macro avg", weights), ("weighted avg", supports)] {
            let avg = |pick: fn(&ClassMetrics) -> f32| weighted_mean(&classes, &w, pick);
            writeln!(
                f,
                "{:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                name,
                avg(|c| c.precision),
                avg(|c| c.recall),
                avg(|c| c.f1),
                total
            )?;
        }
        Ok(())
    }
}

/// Outcome for one evaluated pair.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluatedPair {
    pub id: String,
    pub before: PathBuf,
    pub after: PathBuf,
    pub true_change: bool,
    pub predicted_change: bool,
    pub confidence: f32,
    pub affected_area: f32,
    pub severity: Severity,
    pub prediction_std: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationSummary {
    pub matrix: ConfusionMatrix,
    pub pairs: Vec<EvaluatedPair>,
    /// Triplets that were found but could not be evaluated.
    pub skipped: usize,
}

impl EvaluationSummary {
    pub fn report(&self) -> ClassificationReport {
        ClassificationReport {
            matrix: self.matrix,
        }
    }

    /// The first `n` evaluated pairs, for a detailed printout.
    pub fn examples(&self, n: usize) -> &[EvaluatedPair] {
        &self.pairs[..n.min(self.pairs.len())]
    }

    /// Plain-text report: sample counts followed by the classification table.
    pub fn render(&self) -> String {
        let mut s = String::new();
        s.push_str("Model Evaluation Report\n");
        s.push_str("=====================\n\n");
        s.push_str(&format!("Total test samples: {}\n", self.matrix.total()));
        s.push_str(&format!(
            "Positive samples (with changes): {}\n",
            self.matrix.positives()
        ));
        s.push_str(&format!(
            "Negative samples (no changes): {}\n",
            self.matrix.negatives()
        ));
        if self.skipped > 0 {
            s.push_str(&format!("Skipped pairs: {}\n", self.skipped));
        }
        s.push_str("\nConfusion Matrix:\n");
        s.push_str(&self.matrix.to_string());
        s.push_str("\nClassification Report:\n");
        s.push_str(&self.report().to_string());
        s
    }
}

/// `(id, before, after, label)` for every complete triplet, sorted by id.
fn collect_triplets(dir: &Path) -> Result<Vec<(String, PathBuf, PathBuf, PathBuf)>> {
    let before_dir = dir.join("A");
    let after_dir = dir.join("B");
    let label_dir = dir.join("label");

    let mut triplets = Vec::new();
    for entry in fs::read_dir(&label_dir)? {
        let label_path = entry?.path();
        if label_path.extension().map_or(true, |ext| ext != "png") {
            continue;
        }
        let Some(id) = label_path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let before = before_dir.join(format!("{id}.png"));
        let after = after_dir.join(format!("{id}.png"));
        if before.exists() && after.exists() {
            triplets.push((id.to_string(), before, after, label_path.clone()));
        }
    }
    triplets.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(triplets)
}

/// Run `detector` over every complete triplet under `dir`.
///
/// Pairs whose label or images fail to load, or whose detection fails, are
/// logged and counted in `skipped`; the rest of the set is still evaluated.
pub fn evaluate_test_set<M: ChangeModel>(
    detector: &MiningDetector<M>,
    dir: &Path,
) -> Result<EvaluationSummary> {
    let triplets = collect_triplets(dir)?;
    info!("evaluating {} pairs from {}", triplets.len(), dir.display());

    let mut summary = EvaluationSummary::default();
    for (id, before, after, label) in triplets {
        let true_change = match load_label(&label) {
            Ok(v) => v,
            Err(e) => {
                warn!("skipping {id}: {e}");
                summary.skipped += 1;
                continue;
            }
        };
        let result = match detector.detect_changes(before.as_path(), after.as_path(), false) {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping {id}: {e}");
                summary.skipped += 1;
                continue;
            }
        };

        let predicted_change = result.confidence > detector.confidence_threshold();
        summary.matrix.record(true_change, predicted_change);
        summary.pairs.push(EvaluatedPair {
            id,
            before,
            after,
            true_change,
            predicted_change,
            confidence: result.confidence,
            affected_area: result.affected_area,
            severity: result.severity,
            prediction_std: result.prediction_std,
        });
    }

    Ok(summary)
}
