//! End-to-end change detection for one image pair.

use std::path::Path;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::analysis::ChangeAnalyzer;
use crate::config::DetectorConfig;
use crate::ensemble::EnsemblePredictor;
use crate::error::Result;
use crate::loader::ModelLocator;
use crate::model::{ChangeModel, SiameseModel};
use crate::normalize::{ImageInput, ImageNormalizer};
use crate::types::{DetectionResult, ImageTensor};

/// Mining change detector: normalization, ensemble voting and pixel analysis
/// around a single loaded model.
///
/// The detector owns its model. To share one model between threads, wrap it
/// in a [`SharedModel`](crate::SharedModel) and hand each detector a clone.
#[derive(Debug)]
pub struct MiningDetector<M> {
    model: M,
    config: DetectorConfig,
    normalizer: ImageNormalizer,
    ensemble: EnsemblePredictor,
    analyzer: ChangeAnalyzer,
}

impl MiningDetector<SiameseModel> {
    /// Load the model from `config.model_candidates`, preceded by `model_path`
    /// when given.
    pub fn from_config(config: DetectorConfig, model_path: Option<&Path>) -> Result<Self> {
        let locator = ModelLocator::with_fallbacks(model_path, config.model_candidates.clone());
        let model = locator.load()?;
        Self::new(model, config)
    }
}

impl<M: ChangeModel> MiningDetector<M> {
    pub fn new(model: M, config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        let ensemble = EnsemblePredictor::new(config.ensemble.clone())?;
        let analyzer = ChangeAnalyzer::new(config.analysis.clone());

        // One throwaway prediction so a broken model fails here rather than
        // on the first real pair.
        model.predict(&[(ImageTensor::zeros(), ImageTensor::zeros())])?;
        info!(
            "detector ready: threshold={}, ensemble_size={}",
            config.confidence_threshold, config.ensemble.ensemble_size
        );

        Ok(Self {
            model,
            config,
            normalizer: ImageNormalizer::new(),
            ensemble,
            analyzer,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.config.confidence_threshold
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Detect changes between two images with a freshly seeded random source
    /// for the ensemble jitter.
    pub fn detect_changes(
        &self,
        before: impl Into<ImageInput>,
        after: impl Into<ImageInput>,
        return_heatmap: bool,
    ) -> Result<DetectionResult> {
        let mut rng = StdRng::from_entropy();
        self.detect_changes_with_rng(before, after, return_heatmap, &mut rng)
    }

    /// Detect changes using `rng` for the ensemble jitter.
    pub fn detect_changes_with_rng<R: Rng + ?Sized>(
        &self,
        before: impl Into<ImageInput>,
        after: impl Into<ImageInput>,
        return_heatmap: bool,
        rng: &mut R,
    ) -> Result<DetectionResult> {
        let before = self.normalizer.normalize(before.into())?;
        let after = self.normalizer.normalize(after.into())?;
        self.detect_tensors(&before, &after, return_heatmap, rng)
    }

    /// Same as [`detect_changes_with_rng`](Self::detect_changes_with_rng) on
    /// already-normalized tensors.
    pub fn detect_tensors<R: Rng + ?Sized>(
        &self,
        before: &ImageTensor,
        after: &ImageTensor,
        return_heatmap: bool,
        rng: &mut R,
    ) -> Result<DetectionResult> {
        let outcome = self.ensemble.detect(&self.model, before, after, rng)?;
        let confidence = outcome.confidence();
        let mut result = DetectionResult::below_threshold(
            confidence,
            outcome.raw_predictions(),
            outcome.uncertainty(),
        );

        if confidence <= self.config.confidence_threshold {
            debug!(
                "confidence {confidence:.3} at or below threshold {}, skipping analysis",
                self.config.confidence_threshold
            );
            return Ok(result);
        }

        let analysis = self.analyzer.analyze(before, after);
        result.affected_area = analysis.affected_area;
        result.severity = analysis.severity;
        if return_heatmap {
            result.heatmap = Some(analysis.mask);
        }
        Ok(result)
    }
}
