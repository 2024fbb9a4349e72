use std::ops::Range;

use thiserror::Error;

/// Errors raised while loading data, building, training, or persisting an autoencoder.
#[derive(Debug, Error)]
pub enum AeError {
    #[error("invalid split: {0}")]
    InvalidSplit(String),

    #[error("rows {rows:?} out of range for dataset with {len} records")]
    RowsOutOfRange { rows: Range<usize>, len: usize },

    #[error("dataset '{0}' not found in container")]
    DatasetNotFound(String),

    #[error("unsupported dataset layout: {0}")]
    UnsupportedDtype(String),

    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    #[error("missing hyperparameter: {0}")]
    MissingParameter(String),

    #[error("invalid value for {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("unknown optimizer '{0}' (expected adam, nadam or adamax)")]
    UnknownOptimizer(String),

    #[error("unknown activation '{0}' (expected relu, elu, tanh or linear)")]
    UnknownActivation(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("trial pruned at epoch {epoch}")]
    Pruned { epoch: usize },

    #[error("tensor data error: {0}")]
    Tensor(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("plot failed: {0}")]
    Plot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Recorder(#[from] burn::record::RecorderError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AeError {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AeError>;
