//! The denoising network contract.
//!
//! The engine never looks inside the network. Sampling needs only
//! [`Denoiser::predict`]; training additionally needs access to the live
//! parameters and their gradients through [`TrainableDenoiser`].

mod affine;
mod onnx;
mod params;

pub use affine::AffineDenoiser;
pub use onnx::OnnxDenoiser;
pub use params::ParamSet;

use crate::conditioning::ConditioningBundle;
use crate::error::{Error, Result};
use crate::image::ImageTensor;

/// A noise predictor conditioned on side inputs and a continuous gamma.
///
/// Implementations must accept a batch in which each example carries its own
/// gamma, and must return a tensor shaped like `noisy`.
pub trait Denoiser: Send + Sync {
    /// Predict the noise contained in `noisy`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying computation fails.
    fn predict(
        &self,
        noisy: &ImageTensor,
        conditioning: &ConditioningBundle,
        gammas: &[f32],
    ) -> Result<ImageTensor>;
}

impl<F> Denoiser for F
where
    F: Fn(&ImageTensor, &ConditioningBundle, &[f32]) -> Result<ImageTensor> + Send + Sync,
{
    fn predict(
        &self,
        noisy: &ImageTensor,
        conditioning: &ConditioningBundle,
        gammas: &[f32],
    ) -> Result<ImageTensor> {
        self(noisy, conditioning, gammas)
    }
}

/// A denoiser whose parameters can be trained.
pub trait TrainableDenoiser: Denoiser + Clone {
    /// Live parameters.
    fn parameters(&self) -> &ParamSet;

    /// Mutable live parameters. Only the optimizer step writes through this.
    fn parameters_mut(&mut self) -> &mut ParamSet;

    /// Gradient of the loss with respect to the parameters, given the
    /// gradient of the loss with respect to the prediction for the same inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward computation fails.
    fn gradients(
        &self,
        noisy: &ImageTensor,
        conditioning: &ConditioningBundle,
        gammas: &[f32],
        grad_output: &ImageTensor,
    ) -> Result<ParamSet>;
}

/// Run a prediction and enforce the shape-preserving contract.
pub(crate) fn predict_checked<D: Denoiser + ?Sized>(
    denoiser: &D,
    noisy: &ImageTensor,
    conditioning: &ConditioningBundle,
    gammas: &[f32],
) -> Result<ImageTensor> {
    let prediction = denoiser.predict(noisy, conditioning, gammas)?;
    if prediction.shape() == noisy.shape() {
        Ok(prediction)
    } else {
        Err(Error::shape(
            format!("prediction {:?}", noisy.shape()),
            prediction.shape(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> ConditioningBundle {
        ConditioningBundle::new(
            ImageTensor::zeros((1, 3, 2, 2)),
            ImageTensor::zeros((1, 3, 2, 2)),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_closure_denoiser() {
        let denoiser = |x: &ImageTensor, _: &ConditioningBundle, g: &[f32]| -> Result<ImageTensor> {
            Ok(x * g[0])
        };
        let out = predict_checked(&denoiser, &ImageTensor::ones((1, 3, 2, 2)), &bundle(), &[0.5]).unwrap();
        assert_eq!(out[[0, 1, 1, 1]], 0.5);
    }

    #[test]
    fn test_shape_contract_enforced() {
        let denoiser = |_: &ImageTensor, _: &ConditioningBundle, _: &[f32]| -> Result<ImageTensor> {
            Ok(ImageTensor::zeros((1, 1, 2, 2)))
        };
        let result = predict_checked(&denoiser, &ImageTensor::ones((1, 3, 2, 2)), &bundle(), &[0.5]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}
