//! # mining-change
//!
//! Detection of mining-related land-cover change between a "before" and an
//! "after" satellite image of the same site.
//!
//! This crate provides:
//! - **Normalization**: files, 8-bit or float rasters and decoded images to a
//!   canonical `256 × 256 × 3` RGB tensor
//! - **Siamese model**: a weight-sharing twin-branch classifier behind the
//!   [`ChangeModel`] trait, loaded once from an ordered list of artifacts
//! - **Ensemble voting**: the model is queried on the unperturbed pair and on
//!   brightness/contrast jittered copies; the median is the confidence and
//!   the spread is the uncertainty
//! - **Change analysis**: a blurred, thresholded difference mask, the
//!   affected-area fraction and a severity label
//! - **Evaluation**: confusion matrix and classification report over a
//!   labelled test set
//!
//! ## Algorithm Overview
//!
//! 1. Normalize both images (RGB, area resize to 256×256, scale to `[0, 1]`)
//! 2. Build `ensemble_size` pairs: the unperturbed pair plus jittered copies
//! 3. Score every pair with the model; confidence = median, uncertainty = std
//! 4. If confidence exceeds the threshold (0.65 by default):
//!    - take the 8-bit luma difference, blur 5×5, threshold at 30
//!    - affected area = changed pixels / all pixels
//!    - severity: `minor` below 10%, `moderate` below 30%, else `severe`
//! 5. Return a [`DetectionResult`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use mining_change::{DetectorConfig, MiningDetector};
//!
//! // Tries best_model.bin, then best_model.bin.bz2
//! let detector = MiningDetector::from_config(DetectorConfig::default(), None)?;
//!
//! let result = detector.detect_changes("site/2019.png", "site/2023.png", true)?;
//! println!(
//!     "confidence={:.3} area={:.3} severity={}",
//!     result.confidence, result.affected_area, result.severity
//! );
//! # Ok::<(), mining_change::Error>(())
//! ```
//!
//! ## Custom Models
//!
//! Implement the [`ChangeModel`] trait to plug in another inference backend:
//!
//! ```rust
//! use mining_change::{ChangeModel, ImageTensor, Result};
//!
//! struct AlwaysUnsure;
//!
//! impl ChangeModel for AlwaysUnsure {
//!     fn predict(&self, pairs: &[(ImageTensor, ImageTensor)]) -> Result<Vec<f32>> {
//!         Ok(vec![0.5; pairs.len()])
//!     }
//! }
//! ```

pub mod analysis;
pub mod config;
mod detector;
pub mod ensemble;
mod error;
pub mod evaluation;
pub mod loader;
mod model;
pub mod normalize;
mod types;

pub use analysis::{ChangeAnalysis, ChangeAnalyzer};
pub use config::{AnalysisConfig, DetectorConfig, EnsembleConfig};
pub use detector::MiningDetector;
pub use ensemble::{EnsembleOutcome, EnsemblePredictor};
pub use error::{Error, Result};
pub use loader::{shared_model, ModelLocator};
pub use model::{ChangeModel, SharedModel, SiameseModel, SiameseModelBuilder};
pub use normalize::{ChannelOrder, ImageInput, ImageNormalizer};
pub use types::{
    DetectionResult, DifferenceMask, ImageTensor, PassKind, PredictionSample, Severity,
    INPUT_CHANNELS, INPUT_SIZE,
};
