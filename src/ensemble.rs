//! Multi-pass augmented ensemble.
//!
//! The model is queried on the unperturbed pair plus `ensemble_size - 1`
//! copies with random brightness and contrast jitter, and the probabilities
//! are reduced to a median confidence and a standard-deviation uncertainty.
//! The median keeps a single outlier pass from flipping the decision.

use log::debug;
use ndarray::Axis;
use rand::Rng;

use crate::config::EnsembleConfig;
use crate::error::{Error, Result};
use crate::model::ChangeModel;
use crate::types::{ImageTensor, PassKind, PredictionSample, INPUT_CHANNELS};

/// Ordered per-pass samples; the first is always the baseline pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleOutcome {
    samples: Vec<PredictionSample>,
}

impl EnsembleOutcome {
    pub fn samples(&self) -> &[PredictionSample] {
        &self.samples
    }

    pub fn baseline(&self) -> Option<&PredictionSample> {
        self.samples.first()
    }

    pub fn raw_predictions(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.probability).collect()
    }

    /// Median of the pass probabilities.
    pub fn confidence(&self) -> f32 {
        median(&self.raw_predictions())
    }

    /// Population standard deviation of the pass probabilities.
    pub fn uncertainty(&self) -> f32 {
        std_dev(&self.raw_predictions())
    }
}

/// Median; the mean of the two middle values for even lengths. NaN if empty.
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Population standard deviation (divides by `n`). NaN if empty.
pub fn std_dev(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt() as f32
}

#[derive(Debug, Clone)]
pub struct EnsemblePredictor {
    config: EnsembleConfig,
}

impl EnsemblePredictor {
    pub fn new(config: EnsembleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Random brightness offset then random contrast stretch about each
    /// channel's mean. Values are not clipped.
    pub fn perturb<R: Rng + ?Sized>(&self, image: &ImageTensor, rng: &mut R) -> ImageTensor {
        let delta = self.config.brightness_delta;
        let offset: f32 = rng.gen_range(-delta..=delta);
        let brightened = image.map(|v| v + offset);

        let (lo, hi) = self.config.contrast_range;
        let factor: f32 = rng.gen_range(lo..=hi);
        let view = brightened.view();
        let pixels = (view.len() / INPUT_CHANNELS) as f64;
        let mut means = [0.0f32; INPUT_CHANNELS];
        for (c, mean) in means.iter_mut().enumerate() {
            let sum: f64 = view.index_axis(Axis(2), c).iter().map(|&v| v as f64).sum();
            *mean = (sum / pixels) as f32;
        }
        ImageTensor::from_fn(|y, x, c| (view[[y, x, c]] - means[c]) * factor + means[c])
    }

    /// Run every pass through `model` and collect the samples.
    ///
    /// Fails with [`Error::ModelInference`] if the model errors or returns
    /// anything other than one probability in `[0, 1]` per pass.
    pub fn detect<M, R>(
        &self,
        model: &M,
        before: &ImageTensor,
        after: &ImageTensor,
        rng: &mut R,
    ) -> Result<EnsembleOutcome>
    where
        M: ChangeModel + ?Sized,
        R: Rng + ?Sized,
    {
        let passes = self.config.ensemble_size;
        let mut pairs = Vec::with_capacity(passes);
        pairs.push((before.clone(), after.clone()));
        for _ in 1..passes {
            let before_aug = self.perturb(before, rng);
            let after_aug = self.perturb(after, rng);
            pairs.push((before_aug, after_aug));
        }

        let probabilities = model
            .predict(&pairs)
            .map_err(|e| match e {
                Error::ModelInference(msg) => Error::ModelInference(msg),
                other => Error::ModelInference(other.to_string()),
            })?;

        if probabilities.len() != passes {
            return Err(Error::ModelInference(format!(
                "model returned {} predictions for {passes} passes",
                probabilities.len()
            )));
        }

        let mut samples = Vec::with_capacity(passes);
        for (i, p) in probabilities.into_iter().enumerate() {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::ModelInference(format!(
                    "pass {i} produced probability {p} outside [0, 1]"
                )));
            }
            let pass = if i == 0 {
                PassKind::Baseline
            } else {
                PassKind::Perturbed(i)
            };
            debug!("ensemble pass {i}: p={p:.4}");
            samples.push(PredictionSample { probability: p, pass });
        }

        Ok(EnsembleOutcome { samples })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::cell::RefCell;

    /// Returns a fixed list of probabilities, recording what it was asked.
    struct ScriptedModel {
        outputs: Vec<f32>,
        seen: RefCell<Vec<(ImageTensor, ImageTensor)>>,
    }

    impl ScriptedModel {
        fn new(outputs: Vec<f32>) -> Self {
            Self {
                outputs,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl ChangeModel for ScriptedModel {
        fn predict(&self, pairs: &[(ImageTensor, ImageTensor)]) -> Result<Vec<f32>> {
            self.seen.borrow_mut().extend_from_slice(pairs);
            Ok(self.outputs[..pairs.len().min(self.outputs.len())].to_vec())
        }
    }

    struct BrokenModel;

    impl ChangeModel for BrokenModel {
        fn predict(&self, _pairs: &[(ImageTensor, ImageTensor)]) -> Result<Vec<f32>> {
            Err(Error::InvalidModel("weights missing".into()))
        }
    }

    fn predictor() -> EnsemblePredictor {
        EnsemblePredictor::new(EnsembleConfig::default()).unwrap()
    }

    fn gradient() -> ImageTensor {
        ImageTensor::from_fn(|y, x, c| ((x + y + c * 50) % 256) as f32 / 255.0)
    }

    #[test]
    fn median_and_std() {
        assert_eq!(median(&[0.1, 0.9, 0.5, 0.5, 0.5]), 0.5);
        assert_eq!(median(&[0.9, 0.1, 0.3]), 0.3);
        assert!((median(&[0.2, 0.4, 0.6, 0.8]) - 0.5).abs() < 1e-6);
        assert!(median(&[]).is_nan());

        assert!(std_dev(&[0.9; 5]) < 1e-6);
        assert!((std_dev(&[0.0, 1.0]) - 0.5).abs() < 1e-6);
        assert!((std_dev(&[0.1, 0.9, 0.5, 0.5, 0.5]) - 0.252_982_2).abs() < 1e-5);
    }

    #[test]
    fn confidence_is_median_of_five_passes() {
        let model = ScriptedModel::new(vec![0.1, 0.9, 0.5, 0.5, 0.5]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let outcome = predictor()
            .detect(&model, &gradient(), &gradient(), &mut rng)
            .unwrap();

        assert_eq!(outcome.samples().len(), 5);
        assert_eq!(outcome.raw_predictions(), vec![0.1, 0.9, 0.5, 0.5, 0.5]);
        assert_eq!(outcome.confidence(), 0.5);
        assert!((outcome.uncertainty() - 0.252_982_2).abs() < 1e-5);
        assert_eq!(outcome.baseline().unwrap().pass, PassKind::Baseline);
        assert_eq!(outcome.samples()[3].pass, PassKind::Perturbed(3));
    }

    #[test]
    fn first_pass_is_unperturbed() {
        let model = ScriptedModel::new(vec![0.5; 5]);
        let before = gradient();
        let after = ImageTensor::zeros();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        predictor().detect(&model, &before, &after, &mut rng).unwrap();

        let seen = model.seen.borrow();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0].0, before);
        assert_eq!(seen[0].1, after);
        assert!(seen[1..].iter().all(|(b, _)| *b != before));
    }

    #[test]
    fn same_seed_gives_same_perturbations() {
        let image = gradient();
        let p = predictor();
        let a = p.perturb(&image, &mut ChaCha8Rng::seed_from_u64(9));
        let b = p.perturb(&image, &mut ChaCha8Rng::seed_from_u64(9));
        let c = p.perturb(&image, &mut ChaCha8Rng::seed_from_u64(10));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn brightness_jitter_stays_within_delta() {
        // A flat image has zero deviation from its mean, so contrast is a no-op
        // and only the brightness offset remains.
        let flat = ImageTensor::from_fn(|_, _, _| 0.5);
        let p = predictor();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let out = p.perturb(&flat, &mut rng);
            let v = out.view()[[0, 0, 0]];
            assert!((v - 0.5).abs() <= 0.1 + 1e-5, "offset {}", v - 0.5);
            assert!(out.view().iter().all(|&w| (w - v).abs() < 1e-6));
        }
    }

    #[test]
    fn contrast_jitter_stays_within_range() {
        let halves = ImageTensor::from_fn(|_, x, _| if x < 128 { 0.25 } else { 0.75 });
        let p = predictor();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for _ in 0..50 {
            let out = p.perturb(&halves, &mut rng);
            let spread = out.view()[[0, 200, 0]] - out.view()[[0, 10, 0]];
            let factor = spread / 0.5;
            assert!((0.9 - 1e-5..=1.1 + 1e-5).contains(&factor), "factor {factor}");
        }
    }

    #[test]
    fn ensemble_size_is_configurable() {
        let config = EnsembleConfig {
            ensemble_size: 3,
            ..EnsembleConfig::default()
        };
        let model = ScriptedModel::new(vec![0.2, 0.8, 0.7]);
        let outcome = EnsemblePredictor::new(config)
            .unwrap()
            .detect(&model, &gradient(), &gradient(), &mut ChaCha8Rng::seed_from_u64(5))
            .unwrap();
        assert_eq!(outcome.samples().len(), 3);
        assert_eq!(outcome.confidence(), 0.7);
    }

    #[test]
    fn model_failures_abort_the_ensemble() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let err = predictor()
            .detect(&BrokenModel, &gradient(), &gradient(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::ModelInference(_)));

        let short = ScriptedModel::new(vec![0.5, 0.5]);
        let err = predictor()
            .detect(&short, &gradient(), &gradient(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::ModelInference(_)));

        let out_of_range = ScriptedModel::new(vec![0.5, 1.5, 0.5, 0.5, 0.5]);
        let err = predictor()
            .detect(&out_of_range, &gradient(), &gradient(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::ModelInference(_)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EnsembleConfig {
            ensemble_size: 0,
            ..EnsembleConfig::default()
        };
        assert!(EnsemblePredictor::new(config).is_err());
    }
}
