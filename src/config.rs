//! Detector configuration.
//!
//! Every field has a default matching the trained model's validation
//! results, so an empty JSON object (`{}`) is a valid config file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Artifact locations tried, in order, when no explicit model path is given.
pub const DEFAULT_MODEL_CANDIDATES: [&str; 2] = ["best_model.bin", "best_model.bin.bz2"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Ensemble confidence above which a pair counts as changed.
    pub confidence_threshold: f32,
    pub ensemble: EnsembleConfig,
    pub analysis: AnalysisConfig,
    /// Ordered model artifact candidates; first existing file wins.
    pub model_candidates: Vec<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            ensemble: EnsembleConfig::default(),
            analysis: AnalysisConfig::default(),
            model_candidates: DEFAULT_MODEL_CANDIDATES.iter().map(PathBuf::from).collect(),
        }
    }
}

/// Knobs for the perturbed-pass ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Total passes, including the unperturbed baseline.
    pub ensemble_size: usize,
    /// Maximum absolute brightness offset added per perturbed image.
    pub brightness_delta: f32,
    /// Inclusive range the contrast factor is drawn from.
    pub contrast_range: (f32, f32),
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 5,
            brightness_delta: 0.1,
            contrast_range: (0.9, 1.1),
        }
    }
}

/// Thresholds used when turning a pixel difference into a severity label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Blurred 8-bit difference at or above which a pixel counts as changed.
    pub diff_threshold: u8,
    /// Affected areas below this are `minor`.
    pub minor_below: f32,
    /// Affected areas below this (and at or above `minor_below`) are `moderate`.
    pub moderate_below: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            diff_threshold: 30,
            minor_below: 0.1,
            moderate_below: 0.3,
        }
    }
}

impl DetectorConfig {
    /// Read a JSON config file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::InvalidConfig(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        self.ensemble.validate()?;
        self.analysis.validate()
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ensemble_size == 0 {
            return Err(Error::InvalidConfig("ensemble_size must be at least 1".into()));
        }
        if !(self.brightness_delta >= 0.0 && self.brightness_delta.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "brightness_delta must be finite and non-negative, got {}",
                self.brightness_delta
            )));
        }
        let (lo, hi) = self.contrast_range;
        if !(lo > 0.0 && lo <= hi && hi.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "contrast_range must satisfy 0 < lo <= hi, got ({lo}, {hi})"
            )));
        }
        Ok(())
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.minor_below
            && self.minor_below <= self.moderate_below
            && self.moderate_below <= 1.0)
        {
            return Err(Error::InvalidConfig(format!(
                "severity thresholds must satisfy 0 < minor_below <= moderate_below <= 1, \
                 got {} and {}",
                self.minor_below, self.moderate_below
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_trained_thresholds() {
        let config = DetectorConfig::default();
        assert_eq!(config.confidence_threshold, 0.65);
        assert_eq!(config.ensemble.ensemble_size, 5);
        assert_eq!(config.ensemble.brightness_delta, 0.1);
        assert_eq!(config.ensemble.contrast_range, (0.9, 1.1));
        assert_eq!(config.analysis.diff_threshold, 30);
        assert_eq!(
            config.model_candidates,
            vec![PathBuf::from("best_model.bin"), PathBuf::from("best_model.bin.bz2")]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: DetectorConfig =
            serde_json::from_str(r#"{ "ensemble": { "ensemble_size": 7 } }"#).unwrap();
        assert_eq!(config.ensemble.ensemble_size, 7);
        assert_eq!(config.ensemble.brightness_delta, 0.1);
        assert_eq!(config.confidence_threshold, 0.65);
    }

    #[test]
    fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detector.json");

        fs::write(&path, r#"{ "confidence_threshold": 0.8 }"#).unwrap();
        let config = DetectorConfig::load(&path).unwrap();
        assert_eq!(config.confidence_threshold, 0.8);

        fs::write(&path, r#"{ "ensemble": { "ensemble_size": 0 } }"#).unwrap();
        assert!(matches!(
            DetectorConfig::load(&path),
            Err(Error::InvalidConfig(_))
        ));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(DetectorConfig::load(&path), Err(Error::Json(_))));
    }

    #[test]
    fn rejects_inconsistent_values() {
        let mut config = DetectorConfig::default();
        config.ensemble.contrast_range = (1.1, 0.9);
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.ensemble.brightness_delta = -0.1;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.analysis.minor_below = 0.5;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
