//! Pixel-level change analysis for pairs the ensemble flagged as changed.
//!
//! 1. Quantize both tensors to 8 bits and take the per-channel absolute
//!    difference.
//! 2. Collapse to luma (`0.299 R + 0.587 G + 0.114 B`).
//! 3. Smooth with a 5×5 Gaussian (separable `[1, 4, 6, 4, 1] / 16`,
//!    reflect-101 borders) to suppress speckle.
//! 4. Binarize at `diff_threshold`; the changed fraction is the affected area.

use log::debug;
use ndarray::Array2;

use crate::config::AnalysisConfig;
use crate::types::{DifferenceMask, ImageTensor, Severity};

/// Normalised 5-tap Gaussian filter `[1, 4, 6, 4, 1] / 16`.
const GAUSSIAN_5TAP: [f32; 5] = [0.0625, 0.25, 0.375, 0.25, 0.0625];

/// Output of [`ChangeAnalyzer::analyze`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeAnalysis {
    pub affected_area: f32,
    pub severity: Severity,
    pub mask: DifferenceMask,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeAnalyzer {
    config: AnalysisConfig,
}

impl ChangeAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn analyze(&self, before: &ImageTensor, after: &ImageTensor) -> ChangeAnalysis {
        let diff = luma_difference(before, after);
        let smoothed = gaussian_blur_5x5(&diff);
        let threshold = self.config.diff_threshold;
        let pixels = smoothed.mapv(|v| if v >= threshold { 255u8 } else { 0u8 });
        let mask = DifferenceMask { pixels };

        let total = mask.pixels.len();
        let changed = mask.changed_pixels();
        let affected_area = if total == 0 {
            0.0
        } else {
            changed as f32 / total as f32
        };
        let severity = self.severity_for(changed, affected_area);
        debug!("change analysis: {changed}/{total} pixels changed, severity={severity}");

        ChangeAnalysis {
            affected_area,
            severity,
            mask,
        }
    }

    /// Bucket an affected-area fraction. Each bucket includes its lower bound.
    pub fn classify(&self, affected_area: f32) -> Severity {
        if affected_area < self.config.minor_below {
            Severity::Minor
        } else if affected_area < self.config.moderate_below {
            Severity::Moderate
        } else {
            Severity::Severe
        }
    }

    fn severity_for(&self, changed: usize, affected_area: f32) -> Severity {
        if changed == 0 {
            Severity::None
        } else {
            self.classify(affected_area)
        }
    }
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Per-pixel luma of the absolute 8-bit difference between two tensors.
fn luma_difference(before: &ImageTensor, after: &ImageTensor) -> Array2<u8> {
    let (a, b) = (before.view(), after.view());
    let (h, w, _) = a.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        let channel = |c: usize| to_u8(a[[y, x, c]]).abs_diff(to_u8(b[[y, x, c]])) as f32;
        let luma = 0.299 * channel(0) + 0.587 * channel(1) + 0.114 * channel(2);
        luma.round().clamp(0.0, 255.0) as u8
    })
}

/// Reflect-101 index: `-1 -> 1`, `n -> n - 2`.
#[inline]
fn reflect_101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let mut i = i;
    while i < 0 || i >= n {
        i = if i < 0 { -i } else { 2 * (n - 1) - i };
    }
    i as usize
}

fn gaussian_blur_5x5(src: &Array2<u8>) -> Array2<u8> {
    let (h, w) = src.dim();
    let radius = (GAUSSIAN_5TAP.len() / 2) as isize;

    let mut horizontal = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (k, tap) in GAUSSIAN_5TAP.iter().enumerate() {
                let sx = reflect_101(x as isize + k as isize - radius, w);
                acc += tap * src[[y, sx]] as f32;
            }
            horizontal[[y, x]] = acc;
        }
    }

    Array2::from_shape_fn((h, w), |(y, x)| {
        let mut acc = 0.0f32;
        for (k, tap) in GAUSSIAN_5TAP.iter().enumerate() {
            let sy = reflect_101(y as isize + k as isize - radius, h);
            acc += tap * horizontal[[sy, x]];
        }
        acc.round().clamp(0.0, 255.0) as u8
    })
}
