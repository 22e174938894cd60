//! Per-pixel affine denoiser.
//!
//! A 1x1 convolution over `[noisy, ambient, flash, mask, gamma]` channels. It
//! is small enough to have an exact analytic backward pass, which makes it the
//! reference model for exercising the training engine.

use ndarray::{s, ArrayD, Axis, Ix1, Ix2, IxDyn, Zip};

use crate::conditioning::ConditioningBundle;
use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::{Denoiser, ParamSet, TrainableDenoiser};

const WEIGHT: &str = "weight";
const BIAS: &str = "bias";

/// Trainable 1x1 convolution denoiser.
#[derive(Debug, Clone)]
pub struct AffineDenoiser {
    target_channels: usize,
    conditioning_channels: usize,
    params: ParamSet,
}

impl AffineDenoiser {
    /// Create a denoiser with zero-initialized parameters.
    ///
    /// A fresh model predicts zero noise everywhere.
    #[must_use]
    pub fn new(target_channels: usize, conditioning_channels: usize) -> Self {
        let inputs = target_channels + conditioning_channels + 1;

        let mut params = ParamSet::new();
        params.insert(WEIGHT, ArrayD::zeros(IxDyn(&[target_channels, inputs])));
        params.insert(BIAS, ArrayD::zeros(IxDyn(&[target_channels])));

        Self {
            target_channels,
            conditioning_channels,
            params,
        }
    }

    /// Number of input channels, including the gamma channel.
    #[must_use]
    pub fn input_channels(&self) -> usize {
        self.target_channels + self.conditioning_channels + 1
    }

    /// Concatenate the network input: noisy sample, conditioning, gamma plane.
    fn inputs(
        &self,
        noisy: &ImageTensor,
        conditioning: &ConditioningBundle,
        gammas: &[f32],
    ) -> Result<ImageTensor> {
        let (n, c, h, w) = noisy.dim();
        if c != self.target_channels {
            return Err(Error::shape(
                format!("{} target channels", self.target_channels),
                noisy.shape(),
            ));
        }
        if conditioning.channels() != self.conditioning_channels {
            return Err(Error::shape(
                format!("{} conditioning channels", self.conditioning_channels),
                conditioning.channels(),
            ));
        }
        if gammas.len() != n {
            return Err(Error::shape(format!("{n} gammas"), gammas.len()));
        }
        conditioning.check_aligned(noisy)?;

        let mut input = ImageTensor::zeros((n, self.input_channels(), h, w));
        input.slice_mut(s![.., ..c, .., ..]).assign(noisy);
        input
            .slice_mut(s![.., c..c + self.conditioning_channels, .., ..])
            .assign(&conditioning.stacked()?);
        for (mut plane, &gamma) in input
            .index_axis_mut(Axis(1), self.input_channels() - 1)
            .axis_iter_mut(Axis(0))
            .zip(gammas)
        {
            plane.fill(gamma);
        }

        Ok(input)
    }

    fn weight(&self) -> Result<ndarray::ArrayView2<'_, f32>> {
        self.params
            .get(WEIGHT)
            .ok_or_else(|| Error::shape("weight tensor", "missing"))?
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| Error::shape("2D weight", e.to_string()))
    }

    fn bias(&self) -> Result<ndarray::ArrayView1<'_, f32>> {
        self.params
            .get(BIAS)
            .ok_or_else(|| Error::shape("bias tensor", "missing"))?
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| Error::shape("1D bias", e.to_string()))
    }
}

impl Denoiser for AffineDenoiser {
    fn predict(
        &self,
        noisy: &ImageTensor,
        conditioning: &ConditioningBundle,
        gammas: &[f32],
    ) -> Result<ImageTensor> {
        let input = self.inputs(noisy, conditioning, gammas)?;
        let (weight, bias) = (self.weight()?, self.bias()?);

        let mut out = ImageTensor::zeros(noisy.raw_dim());
        for (o, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
            plane.fill(bias[o]);
            for (i, channel) in input.axis_iter(Axis(1)).enumerate() {
                let w = weight[[o, i]];
                if w != 0.0 {
                    plane.scaled_add(w, &channel);
                }
            }
        }

        Ok(out)
    }
}

impl TrainableDenoiser for AffineDenoiser {
    fn parameters(&self) -> &ParamSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    #[allow(clippy::cast_possible_truncation)]
    fn gradients(
        &self,
        noisy: &ImageTensor,
        conditioning: &ConditioningBundle,
        gammas: &[f32],
        grad_output: &ImageTensor,
    ) -> Result<ParamSet> {
        if grad_output.shape() != noisy.shape() {
            return Err(Error::shape(
                format!("gradient {:?}", noisy.shape()),
                grad_output.shape(),
            ));
        }
        let input = self.inputs(noisy, conditioning, gammas)?;

        let mut grad_weight = ArrayD::zeros(IxDyn(&[self.target_channels, self.input_channels()]));
        let mut grad_bias = ArrayD::zeros(IxDyn(&[self.target_channels]));

        for (o, upstream) in grad_output.axis_iter(Axis(1)).enumerate() {
            grad_bias[[o]] = upstream.iter().map(|&g| f64::from(g)).sum::<f64>() as f32;
            for (i, channel) in input.axis_iter(Axis(1)).enumerate() {
                let dot = Zip::from(&upstream)
                    .and(&channel)
                    .fold(0.0_f64, |acc, &g, &x| f64::from(g).mul_add(f64::from(x), acc));
                grad_weight[[o, i]] = dot as f32;
            }
        }

        let mut grads = ParamSet::new();
        grads.insert(WEIGHT, grad_weight);
        grads.insert(BIAS, grad_bias);
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(n: usize) -> ConditioningBundle {
        ConditioningBundle::new(
            ImageTensor::from_elem((n, 3, 2, 3), 0.5),
            ImageTensor::from_elem((n, 3, 2, 3), -0.25),
            Some(ImageTensor::ones((n, 1, 2, 3))),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_model_predicts_zero() {
        let model = AffineDenoiser::new(3, 7);
        let noisy = ImageTensor::ones((2, 3, 2, 3));
        let out = model.predict(&noisy, &bundle(2), &[0.1, 0.9]).unwrap();
        assert_eq!(out, ImageTensor::zeros((2, 3, 2, 3)));
    }

    #[test]
    fn test_forward_uses_all_inputs() {
        let mut model = AffineDenoiser::new(1, 7);
        {
            let weight = model.parameters_mut().get_mut(WEIGHT).unwrap();
            weight[[0, 0]] = 2.0; // noisy
            weight[[0, 1]] = 1.0; // ambient red
            weight[[0, 7]] = 3.0; // mask
            weight[[0, 8]] = 10.0; // gamma
        }
        model.parameters_mut().get_mut(BIAS).unwrap()[[0]] = 0.125;

        let noisy = ImageTensor::from_elem((2, 1, 2, 3), 1.0);
        let out = model.predict(&noisy, &bundle(2), &[0.0, 0.5]).unwrap();

        assert!((out[[0, 0, 0, 0]] - (2.0 + 0.5 + 3.0 + 0.125)).abs() < 1e-6);
        assert!((out[[1, 0, 1, 2]] - (2.0 + 0.5 + 3.0 + 5.0 + 0.125)).abs() < 1e-6);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut model = AffineDenoiser::new(1, 7);
        model.parameters_mut().get_mut(WEIGHT).unwrap()[[0, 0]] = 0.3;

        let noisy = ImageTensor::from_shape_fn((2, 1, 2, 3), |(n, _, y, x)| {
            (n + y + x) as f32 * 0.1
        });
        let conditioning = bundle(2);
        let gammas = [0.2, 0.7];

        // Loss = sum(pred), so dL/dpred = 1.
        let loss = |m: &AffineDenoiser| -> f64 {
            m.predict(&noisy, &conditioning, &gammas)
                .unwrap()
                .iter()
                .map(|&v| f64::from(v))
                .sum()
        };
        let grads = model
            .gradients(&noisy, &conditioning, &gammas, &ImageTensor::ones(noisy.raw_dim()))
            .unwrap();

        for idx in [[0, 0], [0, 1], [0, 8]] {
            let mut bumped = model.clone();
            bumped.parameters_mut().get_mut(WEIGHT).unwrap()[idx] += 0.01;
            let numeric = (loss(&bumped) - loss(&model)) / 0.01;
            let analytic = f64::from(grads.get(WEIGHT).unwrap()[idx]);
            assert!((numeric - analytic).abs() < 1e-2, "{idx:?}: {numeric} vs {analytic}");
        }

        assert!((grads.get(BIAS).unwrap()[[0]] - 12.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_wrong_conditioning() {
        let model = AffineDenoiser::new(3, 6);
        let noisy = ImageTensor::ones((2, 3, 2, 3));
        assert!(model.predict(&noisy, &bundle(2), &[0.1, 0.9]).is_err());
    }
}
