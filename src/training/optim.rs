//! Parameter optimizers.

use std::collections::BTreeMap;

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::denoiser::ParamSet;
use crate::error::{Error, Result};

/// Serializable optimizer state: a step counter plus named buffers shaped like
/// the parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Number of updates applied.
    pub step: u64,
    /// Per-parameter buffers by name, e.g. Adam's `m` and `v`.
    pub buffers: BTreeMap<String, ParamSet>,
}

/// Applies reduced gradients to parameters.
pub trait Optimizer: Clone + Send {
    /// Update `params` in place.
    ///
    /// # Errors
    ///
    /// Returns an error if `grads` does not match the parameter layout.
    fn step(&mut self, params: &mut ParamSet, grads: &ParamSet) -> Result<()>;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    /// Replace the learning rate. Accumulated state is kept.
    fn set_learning_rate(&mut self, learning_rate: f64);

    /// Snapshot of the internal state.
    fn state(&self) -> OptimizerState;

    /// Restore a snapshot taken with [`Optimizer::state`].
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is missing buffers.
    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Step size.
    pub learning_rate: f64,
    /// First moment decay.
    pub beta1: f64,
    /// Second moment decay.
    pub beta2: f64,
    /// Added to the denominator for stability.
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

const FIRST_MOMENT: &str = "m";
const SECOND_MOMENT: &str = "v";

/// Adam with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    t: u64,
    m: ParamSet,
    v: ParamSet,
}

impl Adam {
    /// Adam with default moments and the given learning rate.
    #[must_use]
    pub fn new(learning_rate: f64) -> Self {
        Self::with_config(AdamConfig {
            learning_rate,
            ..AdamConfig::default()
        })
    }

    /// Adam with explicit hyperparameters.
    #[must_use]
    pub fn with_config(config: AdamConfig) -> Self {
        Self {
            config,
            t: 0,
            m: ParamSet::new(),
            v: ParamSet::new(),
        }
    }
}

impl Optimizer for Adam {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn step(&mut self, params: &mut ParamSet, grads: &ParamSet) -> Result<()> {
        if !params.same_layout(grads) {
            return Err(Error::shape(
                format!("gradients for {} tensors", params.len()),
                grads.len(),
            ));
        }
        if self.m.is_empty() {
            self.m = params.zeros_like();
            self.v = params.zeros_like();
        } else if !self.m.same_layout(params) {
            return Err(Error::shape("optimizer moments matching parameters", self.m.len()));
        }

        self.t += 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.t as i32);
        let bias2 = 1.0 - beta2.powi(self.t as i32);

        for (name, param) in params.iter_mut() {
            let (Some(grad), Some(m), Some(v)) =
                (grads.get(name), self.m.get_mut(name), self.v.get_mut(name))
            else {
                return Err(Error::shape(format!("tensor {name}"), "missing"));
            };

            Zip::from(param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    let g = f64::from(g);
                    let m_next = beta1.mul_add(f64::from(*m), (1.0 - beta1) * g);
                    let v_next = beta2.mul_add(f64::from(*v), (1.0 - beta2) * g * g);
                    let update = learning_rate * (m_next / bias1) / ((v_next / bias2).sqrt() + epsilon);
                    *m = m_next as f32;
                    *v = v_next as f32;
                    *p = (f64::from(*p) - update) as f32;
                });
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.config.learning_rate = learning_rate;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.t,
            buffers: BTreeMap::from([
                (FIRST_MOMENT.to_string(), self.m.clone()),
                (SECOND_MOMENT.to_string(), self.v.clone()),
            ]),
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        let (Some(m), Some(v)) = (
            state.buffers.remove(FIRST_MOMENT),
            state.buffers.remove(SECOND_MOMENT),
        ) else {
            return Err(Error::shape("adam moment buffers", state.buffers.keys().collect::<Vec<_>>()));
        };
        if !m.same_layout(&v) {
            return Err(Error::shape("matching adam moments", (m.len(), v.len())));
        }

        self.t = state.step;
        self.m = m;
        self.v = v;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn set(values: &[f32]) -> ParamSet {
        let mut set = ParamSet::new();
        set.insert("w", ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap());
        set
    }

    #[test]
    fn test_first_step_moves_against_gradient() {
        let mut adam = Adam::new(0.1);
        let mut params = set(&[1.0, 1.0, 1.0]);
        adam.step(&mut params, &set(&[2.0, -0.5, 0.0])).unwrap();

        let w = params.get("w").unwrap();
        // Bias-corrected first step has magnitude ~lr for any non-zero gradient.
        assert!((w[[0]] - 0.9).abs() < 1e-4);
        assert!((w[[1]] - 1.1).abs() < 1e-4);
        assert_eq!(w[[2]], 1.0);
    }

    #[test]
    fn test_minimizes_quadratic() {
        let mut adam = Adam::new(0.05);
        let mut params = set(&[3.0]);
        for _ in 0..500 {
            let x = params.get("w").unwrap()[[0]];
            adam.step(&mut params, &set(&[2.0 * (x - 1.0)])).unwrap();
        }
        assert!((params.get("w").unwrap()[[0]] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_state_restores_trajectory() {
        let mut a = Adam::new(0.01);
        let mut pa = set(&[0.5, -0.5]);
        a.step(&mut pa, &set(&[1.0, 2.0])).unwrap();

        let mut b = Adam::new(0.01);
        b.load_state(a.state()).unwrap();
        let mut pb = pa.clone();

        a.step(&mut pa, &set(&[0.3, -0.7])).unwrap();
        b.step(&mut pb, &set(&[0.3, -0.7])).unwrap();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_set_learning_rate_keeps_moments() {
        let mut adam = Adam::new(0.01);
        let mut params = set(&[1.0]);
        adam.step(&mut params, &set(&[1.0])).unwrap();

        adam.set_learning_rate(0.2);
        assert_eq!(adam.learning_rate(), 0.2);
        assert_eq!(adam.state().step, 1);
    }

    #[test]
    fn test_rejects_mismatched_gradients() {
        let mut adam = Adam::new(0.01);
        let mut params = set(&[1.0]);
        let mut grads = set(&[1.0]);
        grads.insert("extra", ArrayD::zeros(IxDyn(&[1])));
        assert!(adam.step(&mut params, &grads).is_err());
    }

    #[test]
    fn test_load_state_requires_moments() {
        let mut adam = Adam::new(0.01);
        assert!(adam.load_state(OptimizerState::default()).is_err());
    }
}
