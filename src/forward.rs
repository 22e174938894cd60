//! Forward corruption process `q(x_gamma | x_0)`.

use ndarray::{Axis, Zip};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::image::ImageTensor;

/// A corrupted training example together with its supervision signal.
#[derive(Debug, Clone)]
pub struct NoisySample {
    /// `sqrt(gamma) * target + sqrt(1 - gamma) * noise`.
    pub noisy: ImageTensor,
    /// The exact noise that produced `noisy`.
    pub noise: ImageTensor,
    /// One gamma per batch example, as passed to the denoiser.
    pub gammas: Vec<f32>,
}

/// Draw a standard normal tensor of the given shape.
pub fn standard_normal<R: Rng + ?Sized>(
    shape: (usize, usize, usize, usize),
    rng: &mut R,
) -> ImageTensor {
    ImageTensor::from_shape_simple_fn(shape, || rng.sample::<f32, _>(StandardNormal))
}

/// Mix a target with known noise at per-example gammas.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if `noise` differs in shape from `target` or
/// the number of gammas differs from the batch size.
#[allow(clippy::cast_possible_truncation)]
pub fn q_sample(target: &ImageTensor, noise: &ImageTensor, gammas: &[f64]) -> Result<ImageTensor> {
    if noise.shape() != target.shape() {
        return Err(Error::shape(format!("noise {:?}", target.shape()), noise.shape()));
    }
    if gammas.len() != target.dim().0 {
        return Err(Error::shape(
            format!("{} gammas", target.dim().0),
            gammas.len(),
        ));
    }

    let mut noisy = target.clone();
    for ((mut out, eps), &gamma) in noisy
        .axis_iter_mut(Axis(0))
        .zip(noise.axis_iter(Axis(0)))
        .zip(gammas)
    {
        let signal = gamma.sqrt() as f32;
        let spread = (1.0 - gamma).max(0.0).sqrt() as f32;
        Zip::from(&mut out)
            .and(&eps)
            .for_each(|x, &e| *x = signal * *x + spread * e);
    }

    Ok(noisy)
}

/// Corrupt a clean target at the given gammas with fresh Gaussian noise.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the number of gammas differs from the
/// batch size.
#[allow(clippy::cast_possible_truncation)]
pub fn corrupt<R: Rng + ?Sized>(
    target: &ImageTensor,
    gammas: &[f64],
    rng: &mut R,
) -> Result<NoisySample> {
    let noise = standard_normal(target.dim(), rng);
    let noisy = q_sample(target, &noise, gammas)?;

    Ok(NoisySample {
        noisy,
        noise,
        gammas: gammas.iter().map(|&g| g as f32).collect(),
    })
}
