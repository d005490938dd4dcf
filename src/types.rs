use std::fmt;

use ndarray::{Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Side length of the square model input, in pixels.
pub const INPUT_SIZE: usize = 256;

/// Number of color channels fed to the model (RGB).
pub const INPUT_CHANNELS: usize = 3;

/// Canonical model input: a `256 × 256 × 3` RGB float image.
///
/// Normalized tensors hold values in `[0, 1]`. Perturbed copies produced by
/// the ensemble may drift slightly outside that range.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Array3<f32>,
}

impl ImageTensor {
    pub const SHAPE: [usize; 3] = [INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS];

    /// Wrap an `(height, width, channels)` array, rejecting any other shape.
    pub fn new(data: Array3<f32>) -> Result<Self> {
        if data.shape() != Self::SHAPE {
            return Err(Error::InvalidTensorShape {
                expected: Self::SHAPE,
                actual: data.shape().to_vec(),
            });
        }
        Ok(Self { data })
    }

    pub fn zeros() -> Self {
        Self {
            data: Array3::zeros((INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS)),
        }
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(usize, usize, usize) -> f32,
    {
        Self {
            data: Array3::from_shape_fn((INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS), |(y, x, c)| {
                f(y, x, c)
            }),
        }
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.data
    }

    /// Apply `f` to every value, keeping the shape.
    pub(crate) fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        Self {
            data: self.data.mapv(f),
        }
    }
}

/// Which ensemble pass produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassKind {
    /// The unperturbed input pair.
    Baseline,
    /// A brightness/contrast jittered copy; carries the pass index (>= 1).
    Perturbed(usize),
}

/// One model probability, tagged with its pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionSample {
    pub probability: f32,
    pub pass: PassKind,
}

/// Coarse label for how much of the scene changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Minor,
    Moderate,
    Severe,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Minor => "minor",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary change mask: 255 where the pair differs, 0 elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct DifferenceMask {
    pub pixels: Array2<u8>,
}

impl DifferenceMask {
    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    /// Number of pixels flagged as changed.
    pub fn changed_pixels(&self) -> usize {
        self.pixels.iter().filter(|&&v| v != 0).count()
    }

    /// Convert to an 8-bit grayscale image for saving or display.
    pub fn to_gray_image(&self) -> image::GrayImage {
        let (h, w) = self.pixels.dim();
        image::GrayImage::from_fn(w as u32, h as u32, |x, y| {
            image::Luma([self.pixels[[y as usize, x as usize]]])
        })
    }
}

/// Everything a single `detect_changes` call reports.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    /// Median probability across the ensemble passes.
    pub confidence: f32,
    /// Per-pass probabilities, baseline first.
    pub raw_predictions: Vec<f32>,
    /// Population standard deviation of `raw_predictions`.
    pub prediction_std: f32,
    /// Fraction of the image flagged as changed, in `[0, 1]`.
    pub affected_area: f32,
    pub severity: Severity,
    #[serde(skip)]
    pub heatmap: Option<DifferenceMask>,
}

impl DetectionResult {
    /// A result for a pair that did not clear the confidence threshold.
    pub fn below_threshold(
        confidence: f32,
        raw_predictions: Vec<f32>,
        prediction_std: f32,
    ) -> Self {
        Self {
            confidence,
            raw_predictions,
            prediction_std,
            affected_area: 0.0,
            severity: Severity::None,
            heatmap: None,
        }
    }

    pub fn has_change(&self) -> bool {
        self.severity != Severity::None
    }
}
