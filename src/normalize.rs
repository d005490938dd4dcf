//! Input decoding and normalization to the canonical model tensor.
//!
//! Every supported representation ends up as a `256 × 256 × 3` RGB
//! [`ImageTensor`] with values in `[0, 1]`:
//!
//! 1. Decode / reinterpret the input as an RGB float array. Grayscale is
//!    replicated to three channels, alpha is dropped, BGR is swapped.
//! 2. Resize with area averaging (each output pixel is the coverage-weighted
//!    mean of the source pixels under it).
//! 3. 8-bit sources are rounded back to integers and divided by 255. Float
//!    sources must already be finite and within `[0, 1]`; anything else is
//!    rejected rather than rescaled.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use log::debug;
use ndarray::{Array2, Array3, ArrayD, ArrayViewD, Ix2, Ix3};

use crate::error::{Error, Result};
use crate::types::{ImageTensor, INPUT_CHANNELS, INPUT_SIZE};

/// Channel order of an in-memory 8-bit raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    #[default]
    Rgb,
    /// Blue first, as produced by most OpenCV-style readers.
    Bgr,
}

/// The image representations accepted by [`ImageNormalizer::normalize`].
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// A PNG/JPEG/... file on disk.
    Path(PathBuf),
    /// An 8-bit raster, either `(h, w)` or `(h, w, c)` with `c` in {1, 3, 4}.
    Raster {
        pixels: ArrayD<u8>,
        order: ChannelOrder,
    },
    /// A float raster already scaled to `[0, 1]`, same shape rules as `Raster`.
    FloatRaster(ArrayD<f32>),
    /// An image that has already been decoded.
    Image(DynamicImage),
}

impl ImageInput {
    pub fn rgb(pixels: ArrayD<u8>) -> Self {
        ImageInput::Raster {
            pixels,
            order: ChannelOrder::Rgb,
        }
    }

    pub fn bgr(pixels: ArrayD<u8>) -> Self {
        ImageInput::Raster {
            pixels,
            order: ChannelOrder::Bgr,
        }
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        ImageInput::Path(path)
    }
}

impl From<&Path> for ImageInput {
    fn from(path: &Path) -> Self {
        ImageInput::Path(path.to_path_buf())
    }
}

impl From<&str> for ImageInput {
    fn from(path: &str) -> Self {
        ImageInput::Path(PathBuf::from(path))
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        ImageInput::Image(image)
    }
}

impl From<Array2<u8>> for ImageInput {
    fn from(pixels: Array2<u8>) -> Self {
        ImageInput::rgb(pixels.into_dyn())
    }
}

impl From<Array3<u8>> for ImageInput {
    fn from(pixels: Array3<u8>) -> Self {
        ImageInput::rgb(pixels.into_dyn())
    }
}

impl From<Array3<f32>> for ImageInput {
    fn from(pixels: Array3<f32>) -> Self {
        ImageInput::FloatRaster(pixels.into_dyn())
    }
}

impl From<ImageTensor> for ImageInput {
    fn from(tensor: ImageTensor) -> Self {
        ImageInput::FloatRaster(tensor.into_inner().into_dyn())
    }
}

/// Turns arbitrary image inputs into model-ready tensors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageNormalizer;

impl ImageNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, input: ImageInput) -> Result<ImageTensor> {
        let (rgb, eight_bit) = match input {
            ImageInput::Path(path) => {
                let image = image::open(&path).map_err(|source| Error::Decode {
                    path: path.clone(),
                    source,
                })?;
                debug!(
                    "decoded {} ({}x{})",
                    path.display(),
                    image.width(),
                    image.height()
                );
                (dynamic_to_rgb(&image), true)
            }
            ImageInput::Image(image) => (dynamic_to_rgb(&image), true),
            ImageInput::Raster { pixels, order } => (raster_to_rgb(pixels.view(), order)?, true),
            ImageInput::FloatRaster(pixels) => {
                check_unit_range(pixels.view())?;
                (raster_to_rgb(pixels.view(), ChannelOrder::Rgb)?, false)
            }
        };

        let resized = resize_area(&rgb, INPUT_SIZE, INPUT_SIZE);
        let scaled = if eight_bit {
            resized.mapv(|v| v.round().clamp(0.0, 255.0) / 255.0)
        } else {
            resized
        };
        ImageTensor::new(scaled)
    }
}

/// Float rasters must already be finite and scaled to `[0, 1]`.
fn check_unit_range(pixels: ArrayViewD<'_, f32>) -> Result<()> {
    match pixels.iter().find(|v| !(0.0..=1.0).contains(*v)) {
        Some(v) => Err(Error::UnsupportedInputKind(format!(
            "float raster value {v} is outside [0, 1]"
        ))),
        None => Ok(()),
    }
}

fn dynamic_to_rgb(image: &DynamicImage) -> Array3<f32> {
    let rgb = image.to_rgb8();
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let raw = rgb.into_raw();
    Array3::from_shape_fn((h, w, INPUT_CHANNELS), |(y, x, c)| {
        raw[(y * w + x) * INPUT_CHANNELS + c] as f32
    })
}

/// Reinterpret a 2-D or 3-D raster as an `(h, w, 3)` RGB float array.
fn raster_to_rgb<T>(pixels: ArrayViewD<'_, T>, order: ChannelOrder) -> Result<Array3<f32>>
where
    T: Copy + Into<f32>,
{
    if pixels.shape().iter().any(|&d| d == 0) {
        return Err(Error::UnsupportedInputKind(format!(
            "empty raster with shape {:?}",
            pixels.shape()
        )));
    }

    match pixels.ndim() {
        2 => {
            let gray = pixels
                .into_dimensionality::<Ix2>()
                .map_err(|e| Error::UnsupportedInputKind(e.to_string()))?;
            let (h, w) = gray.dim();
            Ok(Array3::from_shape_fn((h, w, INPUT_CHANNELS), |(y, x, _)| {
                gray[[y, x]].into()
            }))
        }
        3 => {
            let img = pixels
                .into_dimensionality::<Ix3>()
                .map_err(|e| Error::UnsupportedInputKind(e.to_string()))?;
            let (h, w, channels) = img.dim();
            let source_channel = |c: usize| -> usize {
                match (channels, order) {
                    (1, _) => 0,
                    (_, ChannelOrder::Bgr) => 2 - c,
                    (_, ChannelOrder::Rgb) => c,
                }
            };
            match channels {
                1 | 3 | 4 => Ok(Array3::from_shape_fn(
                    (h, w, INPUT_CHANNELS),
                    |(y, x, c)| img[[y, x, source_channel(c)]].into(),
                )),
                n => Err(Error::UnsupportedInputKind(format!(
                    "raster with {n} channels (expected 1, 3 or 4)"
                ))),
            }
        }
        n => Err(Error::UnsupportedInputKind(format!(
            "raster with {n} dimensions (expected 2 or 3)"
        ))),
    }
}

/// Source taps and weights contributing to each output index along one axis.
fn area_taps(src: usize, dst: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|i| {
            let start = i as f64 * scale;
            let end = start + scale;
            let mut taps = Vec::new();
            let mut j = start.floor() as usize;
            while (j as f64) < end && j < src {
                let covered = end.min((j + 1) as f64) - start.max(j as f64);
                if covered > 1e-9 {
                    taps.push((j, (covered / scale) as f32));
                }
                j += 1;
            }
            taps
        })
        .collect()
}

/// Area-averaging resize of an `(h, w, c)` array to `(dst_h, dst_w, c)`.
///
/// Same-size resizes are exact copies.
pub fn resize_area(src: &Array3<f32>, dst_h: usize, dst_w: usize) -> Array3<f32> {
    let (src_h, src_w, channels) = src.dim();
    let x_taps = area_taps(src_w, dst_w);
    let y_taps = area_taps(src_h, dst_h);

    let mut horizontal = Array3::<f32>::zeros((src_h, dst_w, channels));
    for y in 0..src_h {
        for (x, taps) in x_taps.iter().enumerate() {
            for c in 0..channels {
                horizontal[[y, x, c]] = taps.iter().map(|&(sx, w)| src[[y, sx, c]] * w).sum();
            }
        }
    }

    let mut out = Array3::<f32>::zeros((dst_h, dst_w, channels));
    for (y, taps) in y_taps.iter().enumerate() {
        for x in 0..dst_w {
            for c in 0..channels {
                out[[y, x, c]] = taps
                    .iter()
                    .map(|&(sy, w)| horizontal[[sy, x, c]] * w)
                    .sum();
            }
        }
    }
    out
}
