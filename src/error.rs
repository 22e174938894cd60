//! Custom error types for flashdiff.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the flashdiff library.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid schedule or configuration value. Raised before any computation starts.
    #[error("invalid configuration {name}: {reason}")]
    Config { name: String, reason: String },

    /// NaN or infinity detected in a loss, gradient, parameter or chain state.
    #[error("numeric instability at step {step}: non-finite {quantity}")]
    NumericInstability { step: u64, quantity: String },

    /// A checkpoint on disk is incomplete or does not match the current run.
    #[error("corrupt checkpoint {path}: {reason}")]
    CheckpointCorruption { path: PathBuf, reason: String },

    /// Failed to serialize a checkpoint.
    #[error("failed to encode checkpoint: {source}")]
    CheckpointEncode {
        #[source]
        source: bincode::error::EncodeError,
    },

    /// A denoiser implementation reported a computation fault.
    #[error("denoiser computation failed: {reason}")]
    DenoiserCompute { reason: String },

    /// ONNX denoiser inference failed.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: ort::Error,
    },

    /// The reverse chain was aborted part way through.
    #[error("reverse chain aborted at step {step}: {source}")]
    ChainAborted {
        step: usize,
        #[source]
        source: Box<Error>,
    },

    /// Workers disagree on the training step counter.
    #[error("lock-step violation on rank {rank}: expected step {expected}, found {found}")]
    LockstepViolation {
        rank: usize,
        expected: u64,
        found: u64,
    },

    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Failed to parse a JSON configuration file.
    #[error("failed to parse configuration {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(name: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(expected: impl std::fmt::Display, actual: impl std::fmt::Debug) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_string(),
            actual: format!("{actual:?}"),
        }
    }
}

/// Result type alias for flashdiff operations.
pub type Result<T> = std::result::Result<T, Error>;
