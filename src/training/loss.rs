//! Noise-prediction loss.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::ImageTensor;

/// Distance between predicted and reference noise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Mean absolute error.
    L1,
    /// Mean squared error.
    #[default]
    L2,
}

impl LossKind {
    /// Mean loss over all elements and its gradient with respect to
    /// `prediction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensors differ in shape.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn evaluate(
        self,
        prediction: &ImageTensor,
        reference: &ImageTensor,
    ) -> Result<(f64, ImageTensor)> {
        if prediction.shape() != reference.shape() {
            return Err(Error::shape(
                format!("reference {:?}", reference.shape()),
                prediction.shape(),
            ));
        }

        let count = prediction.len().max(1) as f64;
        let diff = prediction - reference;

        let (total, grad) = match self {
            Self::L1 => (
                diff.iter().map(|&d| f64::from(d).abs()).sum::<f64>(),
                diff.mapv(|d| {
                    if d == 0.0 {
                        0.0
                    } else {
                        (f64::from(d.signum()) / count) as f32
                    }
                }),
            ),
            Self::L2 => (
                diff.iter().map(|&d| f64::from(d) * f64::from(d)).sum::<f64>(),
                diff.mapv(|d| (2.0 * f64::from(d) / count) as f32),
            ),
        };

        Ok((total / count, grad))
    }
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::L1 => write!(f, "l1"),
            Self::L2 => write!(f, "l2"),
        }
    }
}
