//! Step-skipping policies for accelerated sampling.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Chooses which training steps an accelerated sampler visits.
pub trait SkipPolicy {
    /// Return `sampling_steps` strictly increasing steps in `[1, num_train_steps]`,
    /// ending at `num_train_steps`.
    ///
    /// Requests for more steps than `num_train_steps` visit every step.
    fn select(&self, num_train_steps: usize, sampling_steps: usize) -> Vec<usize>;
}

/// Built-in skip policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipKind {
    /// Evenly spaced steps.
    #[default]
    Uniform,
    /// Steps spaced quadratically, denser close to the clean image.
    Quadratic,
}

impl SkipPolicy for SkipKind {
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn select(&self, num_train_steps: usize, sampling_steps: usize) -> Vec<usize> {
        let (total, steps) = (num_train_steps, sampling_steps.min(num_train_steps));

        match self {
            Self::Uniform => (1..=steps).map(|k| (k * total).div_ceil(steps)).collect(),
            Self::Quadratic => {
                let mut out: Vec<usize> = Vec::with_capacity(steps);
                for k in 1..=steps {
                    let frac = k as f64 / steps as f64;
                    let raw = (frac * frac * total as f64).ceil() as usize;
                    let floor = out.last().map_or(1, |prev| prev + 1);
                    out.push(raw.clamp(floor, total - (steps - k)));
                }
                out
            }
        }
    }
}

pub(super) fn check_selection(selected: &[usize], total: usize, steps: usize) -> Result<()> {
    let valid = selected.len() == steps
        && selected.first().is_some_and(|&t| t >= 1)
        && selected.last() == Some(&total)
        && selected.windows(2).all(|w| w[0] < w[1]);

    if valid {
        Ok(())
    } else {
        Err(Error::config(
            "skip_policy",
            format!("invalid step selection for {steps} of {total} steps"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_selection() {
        assert_eq!(SkipKind::Uniform.select(10, 5), vec![2, 4, 6, 8, 10]);
        assert_eq!(SkipKind::Uniform.select(10, 3), vec![4, 7, 10]);
        assert_eq!(SkipKind::Uniform.select(7, 7), (1..=7).collect::<Vec<_>>());
    }

    #[test]
    fn test_quadratic_selection_is_valid() {
        for (total, steps) in [(1000, 50), (1000, 999), (10, 10), (100, 3)] {
            let selected = SkipKind::Quadratic.select(total, steps);
            assert!(check_selection(&selected, total, steps).is_ok(), "{total}/{steps}");
        }
    }

    #[test]
    fn test_oversized_request_visits_every_step() {
        for kind in [SkipKind::Uniform, SkipKind::Quadratic] {
            assert_eq!(kind.select(6, 10), (1..=6).collect::<Vec<_>>());
            assert!(kind.select(0, 3).is_empty());
            assert!(kind.select(5, 0).is_empty());
        }
    }

    #[test]
    fn test_quadratic_denser_near_start() {
        let selected = SkipKind::Quadratic.select(1000, 20);
        let first_gap = selected[1] - selected[0];
        let last_gap = selected[19] - selected[18];
        assert!(first_gap < last_gap);
    }

    #[test]
    fn test_check_rejects_bad_selection() {
        assert!(check_selection(&[1, 1, 10], 10, 3).is_err());
        assert!(check_selection(&[1, 5, 9], 10, 3).is_err());
        assert!(check_selection(&[0, 5, 10], 10, 3).is_err());
        assert!(check_selection(&[5, 10], 10, 3).is_err());
    }
}
