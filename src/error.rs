use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported image input: {0}")]
    UnsupportedInputKind(String),

    #[error("Failed to decode image {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid tensor shape: expected {expected:?}, got {actual:?}")]
    InvalidTensorShape {
        expected: [usize; 3],
        actual: Vec<usize>,
    },

    #[error("No trained model found. Tried: {tried:?}")]
    ModelNotFound { tried: Vec<PathBuf> },

    #[error("Failed to load model {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },

    #[error("Model inference failed: {0}")]
    ModelInference(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
