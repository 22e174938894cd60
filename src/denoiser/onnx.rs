//! Denoiser backed by an exported ONNX network.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array4};
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;

use crate::conditioning::ConditioningBundle;
use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::Denoiser;

/// ONNX denoiser.
///
/// The network must take three inputs:
/// - `sample`: noisy image, NCHW
/// - `condition`: ambient, flash and mask stacked on the channel axis, NCHW
/// - `gamma`: one value per batch example
///
/// and return the predicted noise shaped like `sample` as its first output.
pub struct OnnxDenoiser {
    path: PathBuf,
    session: Mutex<Session>,
}

impl OnnxDenoiser {
    /// Load an ONNX model session.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        tracing::info!("Loading denoiser from {}", path.display());

        let session = Session::builder()
            .map_err(|source| Error::ModelLoad {
                path: path.clone(),
                source,
            })?
            .commit_from_file(&path)
            .map_err(|source| Error::ModelLoad {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            session: Mutex::new(session),
        })
    }

    /// Path the model was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Denoiser for OnnxDenoiser {
    fn predict(
        &self,
        noisy: &ImageTensor,
        conditioning: &ConditioningBundle,
        gammas: &[f32],
    ) -> Result<ImageTensor> {
        let sample_value =
            Tensor::from_array(noisy.clone()).map_err(|source| Error::Inference { source })?;

        let condition_value = Tensor::from_array(conditioning.stacked()?)
            .map_err(|source| Error::Inference { source })?;

        let gamma_value = Tensor::from_array(Array1::from(gammas.to_vec()))
            .map_err(|source| Error::Inference { source })?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                "sample" => sample_value,
                "condition" => condition_value,
                "gamma" => gamma_value,
            ])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "noise prediction output".to_string(),
                actual: "no output".to_string(),
            })?;

        extract_array4(&output)
    }
}

/// Extract a 4D array from an ONNX value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn extract_array4(value: &ort::value::ValueRef<'_>) -> Result<Array4<f32>> {
    let (shape_info, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Inference { source })?;

    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    if dims.len() != 4 {
        return Err(Error::ShapeMismatch {
            expected: "4D tensor".to_string(),
            actual: format!("{}D tensor", dims.len()),
        });
    }

    Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), data.to_vec()).map_err(|_| {
        Error::ShapeMismatch {
            expected: format!("{dims:?}"),
            actual: "reshape failed".to_string(),
        }
    })
}
