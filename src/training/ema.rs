//! Exponential moving average of the live parameters.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use crate::denoiser::ParamSet;

/// Shadow copy of the parameters, decayed after every optimizer step.
///
/// The shadow is held in `f64`. At decays close to 1 the per-step increment
/// falls below `f32` resolution long before the shadow reaches the live value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ema {
    decay: f64,
    shadow: BTreeMap<String, ArrayD<f64>>,
}

impl Ema {
    /// Start tracking from `params`.
    #[must_use]
    pub fn new(decay: f64, params: &ParamSet) -> Self {
        Self {
            decay,
            shadow: params
                .iter()
                .map(|(name, tensor)| (name.to_string(), tensor.mapv(f64::from)))
                .collect(),
        }
    }

    /// The same shadow tracked with a different decay.
    #[must_use]
    pub fn with_decay(self, decay: f64) -> Self {
        Self { decay, ..self }
    }

    /// `shadow ← decay * shadow + (1 - decay) * live`.
    ///
    /// Tensors missing from `live` are left untouched.
    pub fn update(&mut self, live: &ParamSet) {
        let decay = self.decay;
        for (name, shadow) in &mut self.shadow {
            if let Some(live) = live.get(name) {
                Zip::from(shadow).and(live).for_each(|s, &y| {
                    let y = f64::from(y);
                    *s = decay.mul_add(*s - y, y);
                });
            }
        }
    }

    /// Decay rate.
    #[must_use]
    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Whether the shadow has the names and shapes of `params`.
    #[must_use]
    pub fn same_layout(&self, params: &ParamSet) -> bool {
        self.shadow.len() == params.len()
            && self
                .shadow
                .iter()
                .zip(params.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.shape() == vb.shape())
    }

    /// Shadow parameters rounded to `f32`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn shadow(&self) -> ParamSet {
        self.shadow
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.mapv(|v| v as f32)))
            .collect()
    }
}
