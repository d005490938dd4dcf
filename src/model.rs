use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ImageTensor, INPUT_CHANNELS, INPUT_SIZE};

/// A binary change classifier over pairs of normalized images.
///
/// `predict` returns one probability in `[0, 1]` per pair. Implementations
/// must not carry state between calls, so batching passes together or
/// sending them one by one gives identical results.
pub trait ChangeModel {
    fn predict(&self, pairs: &[(ImageTensor, ImageTensor)]) -> Result<Vec<f32>>;
}

impl<M: ChangeModel + ?Sized> ChangeModel for &M {
    fn predict(&self, pairs: &[(ImageTensor, ImageTensor)]) -> Result<Vec<f32>> {
        (**self).predict(pairs)
    }
}

impl<M: ChangeModel + ?Sized> ChangeModel for Box<M> {
    fn predict(&self, pairs: &[(ImageTensor, ImageTensor)]) -> Result<Vec<f32>> {
        (**self).predict(pairs)
    }
}

/// Twin-branch change classifier with shared weights.
///
/// Both images go through the same embedding branch:
/// - per-channel average pooling over a `pool_grid × pool_grid` grid
/// - a dense layer followed by ReLU
///
/// The head scores the absolute embedding difference with a dense layer and
/// a sigmoid, giving the probability that the pair shows a change.
///
/// # Usage
///
/// ```ignore
/// let model = SiameseModel::load("best_model.bin")?;
/// let probs = model.predict(&[(before, after)])?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiameseModel {
    /// Pooling grid side; the branch sees `pool_grid² × 3` features.
    pool_grid: usize,

    /// Embedding layer, shape `(embedding_dim, features)`.
    embed_weights: Array2<f32>,
    embed_bias: Array1<f32>,

    /// Head weights over the absolute embedding difference.
    head_weights: Array1<f32>,
    head_bias: f32,
}

impl SiameseModel {
    /// Load a model from a binary file. Paths ending in `.bz2` are decompressed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let is_bz2 = path.extension().is_some_and(|ext| ext == "bz2");
        let mut bytes = Vec::new();
        if is_bz2 {
            BzDecoder::new(reader).read_to_end(&mut bytes)?;
        } else {
            let mut reader = reader;
            reader.read_to_end(&mut bytes)?;
        }

        let model: Self = bincode::deserialize(&bytes)?;
        model.validate()?;
        Ok(model)
    }

    /// Save the model to a binary file. Paths ending in `.bz2` are compressed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let bytes = bincode::serialize(self)?;

        if path.extension().is_some_and(|ext| ext == "bz2") {
            let mut encoder = BzEncoder::new(BufWriter::new(file), Compression::best());
            encoder.write_all(&bytes)?;
            encoder.finish()?.flush()?;
        } else {
            let mut writer = BufWriter::new(file);
            writer.write_all(&bytes)?;
            writer.flush()?;
        }
        Ok(())
    }

    pub fn pool_grid(&self) -> usize {
        self.pool_grid
    }

    pub fn embedding_dim(&self) -> usize {
        self.embed_weights.nrows()
    }

    fn num_features(&self) -> usize {
        self.pool_grid * self.pool_grid * INPUT_CHANNELS
    }

    fn validate(&self) -> Result<()> {
        if self.pool_grid == 0 || self.pool_grid > INPUT_SIZE {
            return Err(Error::InvalidModel(format!(
                "pool_grid must be in 1..={INPUT_SIZE}, got {}",
                self.pool_grid
            )));
        }
        let (dim, features) = self.embed_weights.dim();
        if dim == 0 {
            return Err(Error::InvalidModel("embedding dimension is zero".into()));
        }
        if features != self.num_features() {
            return Err(Error::InvalidModel(format!(
                "embedding layer expects {features} features, branch produces {}",
                self.num_features()
            )));
        }
        if self.embed_bias.len() != dim || self.head_weights.len() != dim {
            return Err(Error::InvalidModel(format!(
                "bias/head sizes ({}, {}) do not match embedding dimension {dim}",
                self.embed_bias.len(),
                self.head_weights.len()
            )));
        }
        let all_finite = self
            .embed_weights
            .iter()
            .chain(self.embed_bias.iter())
            .chain(self.head_weights.iter())
            .all(|v| v.is_finite())
            && self.head_bias.is_finite();
        if !all_finite {
            return Err(Error::InvalidModel("non-finite weight".into()));
        }
        Ok(())
    }

    /// Shared branch: grid-pooled features through the embedding layer.
    fn embed(&self, image: &ImageTensor) -> Array1<f32> {
        let pooled = grid_pool(image, self.pool_grid);
        let mut embedding = self.embed_weights.dot(&pooled) + &self.embed_bias;
        embedding.mapv_inplace(|v| v.max(0.0));
        embedding
    }

    /// Change probability for a single pair.
    pub fn predict_pair(&self, before: &ImageTensor, after: &ImageTensor) -> f32 {
        let distance = (self.embed(before) - self.embed(after)).mapv(f32::abs);
        sigmoid(self.head_weights.dot(&distance) + self.head_bias)
    }
}

impl ChangeModel for SiameseModel {
    fn predict(&self, pairs: &[(ImageTensor, ImageTensor)]) -> Result<Vec<f32>> {
        pairs
            .iter()
            .map(|(before, after)| {
                let p = self.predict_pair(before, after);
                if p.is_finite() {
                    Ok(p)
                } else {
                    Err(Error::ModelInference(format!("non-finite output {p}")))
                }
            })
            .collect()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Average each channel over the cells of a `grid × grid` partition.
fn grid_pool(image: &ImageTensor, grid: usize) -> Array1<f32> {
    let view = image.view();
    let mut features = Array1::zeros(grid * grid * INPUT_CHANNELS);
    for gy in 0..grid {
        let (y0, y1) = (gy * INPUT_SIZE / grid, (gy + 1) * INPUT_SIZE / grid);
        for gx in 0..grid {
            let (x0, x1) = (gx * INPUT_SIZE / grid, (gx + 1) * INPUT_SIZE / grid);
            let count = ((y1 - y0) * (x1 - x0)) as f32;
            for c in 0..INPUT_CHANNELS {
                let mut sum = 0.0f32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += view[[y, x, c]];
                    }
                }
                features[(gy * grid + gx) * INPUT_CHANNELS + c] = sum / count;
            }
        }
    }
    features
}

/// Builder for creating a SiameseModel.
pub struct SiameseModelBuilder {
    pool_grid: usize,
    embedding: Option<(Array2<f32>, Array1<f32>)>,
    head: Option<(Array1<f32>, f32)>,
}

impl SiameseModelBuilder {
    pub fn new() -> Self {
        Self {
            pool_grid: 8,
            embedding: None,
            head: None,
        }
    }

    pub fn pool_grid(mut self, grid: usize) -> Self {
        self.pool_grid = grid;
        self
    }

    /// Set the shared embedding layer, weights shaped `(dim, pool_grid² × 3)`.
    pub fn embedding(mut self, weights: Array2<f32>, bias: Array1<f32>) -> Self {
        self.embedding = Some((weights, bias));
        self
    }

    /// Use the pooled features directly as the embedding.
    pub fn identity_embedding(self) -> Self {
        let features = self.pool_grid * self.pool_grid * INPUT_CHANNELS;
        self.embedding(Array2::eye(features), Array1::zeros(features))
    }

    pub fn head(mut self, weights: Array1<f32>, bias: f32) -> Self {
        self.head = Some((weights, bias));
        self
    }

    /// Build the SiameseModel.
    pub fn build(self) -> Result<SiameseModel> {
        let (embed_weights, embed_bias) = self
            .embedding
            .ok_or_else(|| Error::InvalidModel("Missing embedding layer".into()))?;
        let (head_weights, head_bias) = self
            .head
            .ok_or_else(|| Error::InvalidModel("Missing head layer".into()))?;

        let model = SiameseModel {
            pool_grid: self.pool_grid,
            embed_weights,
            embed_bias,
            head_weights,
            head_bias,
        };
        model.validate()?;
        Ok(model)
    }
}

impl Default for SiameseModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to one model instance.
///
/// Clones share the same model; every `predict` call holds the lock for its
/// whole batch. Use separate handles (separately loaded models) for parallel
/// inference.
#[derive(Debug)]
pub struct SharedModel<M> {
    inner: Arc<Mutex<M>>,
}

impl<M> SharedModel<M> {
    pub fn new(model: M) -> Self {
        Self {
            inner: Arc::new(Mutex::new(model)),
        }
    }
}

impl<M> Clone for SharedModel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ChangeModel> ChangeModel for SharedModel<M> {
    fn predict(&self, pairs: &[(ImageTensor, ImageTensor)]) -> Result<Vec<f32>> {
        let model = self
            .inner
            .lock()
            .map_err(|_| Error::ModelInference("model lock poisoned".into()))?;
        model.predict(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_dummy_model(head_weight: f32, head_bias: f32) -> SiameseModel {
        let grid = 2;
        let features = grid * grid * INPUT_CHANNELS;
        SiameseModelBuilder::new()
            .pool_grid(grid)
            .identity_embedding()
            .head(Array1::from_elem(features, head_weight), head_bias)
            .build()
            .unwrap()
    }

    fn block_image(value: f32) -> ImageTensor {
        ImageTensor::from_fn(|y, x, _| if y < 128 && x < 128 { value } else { 0.0 })
    }

    #[test]
    fn model_initialization() {
        let model = create_dummy_model(1.0, 0.0);
        assert_eq!(model.pool_grid(), 2);
        assert_eq!(model.embedding_dim(), 12);
    }

    #[test]
    fn identical_pair_scores_head_bias() {
        let model = create_dummy_model(5.0, -2.0);
        let image = block_image(0.7);
        let p = model.predict_pair(&image, &image);
        assert!((p - sigmoid(-2.0)).abs() < 1e-6);
    }

    #[test]
    fn larger_difference_scores_higher() {
        let model = create_dummy_model(5.0, -2.0);
        let base = ImageTensor::zeros();
        let small = model.predict_pair(&base, &block_image(0.2));
        let large = model.predict_pair(&base, &block_image(1.0));
        assert!(small > sigmoid(-2.0));
        assert!(large > small);
        assert!(large <= 1.0);
    }

    #[test]
    fn branches_share_weights() {
        let model = create_dummy_model(5.0, -2.0);
        let a = block_image(0.3);
        let b = block_image(0.9);
        assert_eq!(model.predict_pair(&a, &b), model.predict_pair(&b, &a));
    }

    #[test]
    fn batch_predict_matches_single_pairs() {
        let model = create_dummy_model(3.0, -1.0);
        let pairs = vec![
            (ImageTensor::zeros(), block_image(0.5)),
            (block_image(0.1), block_image(0.1)),
            (block_image(1.0), ImageTensor::zeros()),
        ];
        let batched = model.predict(&pairs).unwrap();
        assert_eq!(batched.len(), 3);
        for (p, (a, b)) in batched.iter().zip(&pairs) {
            assert_eq!(*p, model.predict_pair(a, b));
        }
    }

    #[test]
    fn builder_rejects_mismatched_layers() {
        let result = SiameseModelBuilder::new()
            .pool_grid(2)
            .embedding(Array2::zeros((4, 10)), Array1::zeros(4))
            .head(Array1::zeros(4), 0.0)
            .build();
        assert!(matches!(result, Err(Error::InvalidModel(_))));

        let result = SiameseModelBuilder::new()
            .pool_grid(2)
            .identity_embedding()
            .head(Array1::zeros(3), 0.0)
            .build();
        assert!(matches!(result, Err(Error::InvalidModel(_))));

        let result = SiameseModelBuilder::new().identity_embedding().build();
        assert!(matches!(result, Err(Error::InvalidModel(_))));
    }

    #[test]
    fn save_and_load_model() {
        let model = create_dummy_model(2.0, -0.5);
        let dir = tempfile::tempdir().unwrap();

        for name in ["model.bin", "model.bin.bz2"] {
            let path = dir.path().join(name);
            model.save(&path).unwrap();

            let loaded = SiameseModel::load(&path).unwrap();
            assert_eq!(loaded.pool_grid(), model.pool_grid());
            assert_eq!(loaded.embedding_dim(), model.embedding_dim());

            let (a, b) = (ImageTensor::zeros(), block_image(0.4));
            assert_eq!(loaded.predict_pair(&a, &b), model.predict_pair(&a, &b));
        }
    }

    #[test]
    fn shared_model_serves_concurrent_callers() {
        let shared = SharedModel::new(create_dummy_model(3.0, -1.0));
        let expected = shared
            .predict(&[(ImageTensor::zeros(), block_image(0.6))])
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let model = shared.clone();
                std::thread::spawn(move || {
                    model
                        .predict(&[(ImageTensor::zeros(), block_image(0.6))])
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
