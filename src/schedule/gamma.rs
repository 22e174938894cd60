//! Continuous gamma encoding.
//!
//! The denoiser is conditioned on gamma itself rather than an integer step, so
//! training draws gammas from the continuous intervals between grid points.

use rand::Rng;

use super::DiffusionSchedule;

impl DiffusionSchedule {
    /// Gamma at a continuous progress value `p ∈ [0, 1]`.
    ///
    /// `p = 0` maps to `gamma(0)`, `p = 1` to `gamma(T)`; values in between
    /// interpolate linearly between neighbouring grid points. Out-of-range
    /// inputs are clamped.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn gamma_at_progress(&self, p: f64) -> f64 {
        let total = self.num_steps();
        let pos = p.clamp(0.0, 1.0) * total as f64;
        let lower = (pos.floor() as usize).min(total);
        if lower == total {
            return self.gamma(total);
        }

        let frac = pos - lower as f64;
        let (a, b) = (self.gamma(lower), self.gamma(lower + 1));
        frac.mul_add(b - a, a)
    }

    /// Draw a training gamma.
    ///
    /// Picks a step `t` uniformly from `[1, T]`, then a gamma uniformly between
    /// `gamma(t)` and `gamma(t - 1)`.
    pub fn sample_training_gamma<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let t = rng.random_range(1..=self.num_steps());
        let (low, high) = (self.gamma(t), self.gamma(t - 1));
        rng.random_range(low..high)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::schedule::{DiffusionSchedule, ScheduleConfig};

    fn schedule() -> DiffusionSchedule {
        DiffusionSchedule::new(&ScheduleConfig {
            num_steps: 100,
            ..ScheduleConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_progress_endpoints() {
        let schedule = schedule();
        assert_eq!(schedule.gamma_at_progress(0.0), 1.0);
        assert_eq!(schedule.gamma_at_progress(1.0), schedule.gamma(100));
        assert_eq!(schedule.gamma_at_progress(2.0), schedule.gamma(100));
        assert_eq!(schedule.gamma_at_progress(0.5), schedule.gamma(50));
    }

    #[test]
    fn test_progress_interpolates() {
        let schedule = schedule();
        let mid = schedule.gamma_at_progress(0.505);
        assert!(mid < schedule.gamma(50));
        assert!(mid > schedule.gamma(51));
    }

    #[test]
    fn test_training_gamma_in_range() {
        let schedule = schedule();
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for _ in 0..1000 {
            let gamma = schedule.sample_training_gamma(&mut rng);
            assert!(gamma >= schedule.gamma(100));
            assert!(gamma < 1.0);
        }
    }
}
