//! Noise schedule construction.
//!
//! A [`DiffusionSchedule`] holds the per-step noise variances `beta_1..beta_T` and
//! the cumulative signal retention `gamma_t = Π_{k≤t} (1 - beta_k)`. It is built
//! once from a [`ScheduleConfig`] and then shared by reference between training
//! and sampling; nothing mutates it afterwards.

mod gamma;
mod respace;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use respace::{SkipKind, SkipPolicy};

/// Upper bound applied to cosine schedule betas.
const COSINE_MAX_BETA: f64 = 0.999;

/// Offset of the cosine schedule, keeps `beta_1` from vanishing.
const COSINE_OFFSET: f64 = 0.008;

/// Shape of the beta sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Betas interpolated linearly between `beta_min` and `beta_max`.
    Linear,
    /// Betas derived from a squared-cosine gamma curve.
    Cosine,
}

impl FromStr for ScheduleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            other => Err(Error::config(
                "schedule_kind",
                format!("unknown schedule kind `{other}`, expected `linear` or `cosine`"),
            )),
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Cosine => f.write_str("cosine"),
        }
    }
}

/// Configuration of the noise schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Schedule shape.
    pub kind: ScheduleKind,

    /// Number of diffusion steps `T`.
    pub num_steps: usize,

    /// Smallest beta (linear schedule start).
    pub beta_min: f64,

    /// Largest beta (linear schedule end).
    pub beta_max: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            kind: ScheduleKind::Linear,
            num_steps: 1000,
            beta_min: 1e-4,
            beta_max: 0.02,
        }
    }
}

impl ScheduleConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `num_steps` is zero or the beta range is not a
    /// non-empty sub-interval of `(0, 1)`.
    pub fn validate(&self) -> Result<()> {
        if self.num_steps == 0 {
            return Err(Error::config("num_steps", "must be greater than 0"));
        }

        for (name, value) in [("beta_min", self.beta_min), ("beta_max", self.beta_max)] {
            if !(value > 0.0 && value < 1.0) {
                return Err(Error::config(name, format!("{value} is outside (0, 1)")));
            }
        }

        if self.beta_min >= self.beta_max {
            return Err(Error::config(
                "beta_min",
                format!(
                    "must be smaller than beta_max ({} >= {})",
                    self.beta_min, self.beta_max
                ),
            ));
        }

        Ok(())
    }
}

/// Posterior coefficients of `q(x_{t-1} | x_t, x_0)` for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Posterior {
    /// Weight of the clean estimate `x0_hat` in the posterior mean.
    pub x0_coef: f64,
    /// Weight of the current sample `x_t` in the posterior mean.
    pub xt_coef: f64,
    /// Variance of the true posterior.
    pub variance: f64,
}

/// Immutable sequence of diffusion coefficients.
///
/// Steps are 1-based: `beta(t)` and `alpha(t)` are defined for `t ∈ [1, T]`,
/// `gamma(t)` for `t ∈ [0, T]` with `gamma(0) == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionSchedule {
    betas: Vec<f64>,
    gammas: Vec<f64>,
}

impl DiffusionSchedule {
    /// Build a schedule from its configuration.
    ///
    /// Identical configurations always produce bit-identical coefficients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        config.validate()?;

        let betas = match config.kind {
            ScheduleKind::Linear => linear_betas(config),
            ScheduleKind::Cosine => cosine_betas(config.num_steps),
        };

        let schedule = Self::from_betas(betas)?;

        tracing::debug!(
            "Built {} schedule: T={}, gamma_T={:.3e}",
            config.kind,
            schedule.num_steps(),
            schedule.gamma(schedule.num_steps())
        );

        if schedule.gamma(schedule.num_steps()) > 1e-3 {
            tracing::warn!(
                "Schedule does not reach pure noise (gamma_T = {:.4}); sampling will start from a partially informative prior",
                schedule.gamma(schedule.num_steps())
            );
        }

        Ok(schedule)
    }

    /// Build a schedule from betas, accumulating gammas.
    fn from_betas(betas: Vec<f64>) -> Result<Self> {
        let mut gammas = Vec::with_capacity(betas.len() + 1);
        gammas.push(1.0);
        let mut acc = 1.0;
        for &beta in &betas {
            acc *= 1.0 - beta;
            gammas.push(acc);
        }

        let schedule = Self { betas, gammas };
        schedule.check()?;
        Ok(schedule)
    }

    /// Build a schedule from a gamma sequence starting at 1.
    pub(crate) fn from_gammas(gammas: Vec<f64>) -> Result<Self> {
        let betas = gammas.windows(2).map(|w| 1.0 - w[1] / w[0]).collect();
        let schedule = Self { betas, gammas };
        schedule.check()?;
        Ok(schedule)
    }

    fn check(&self) -> Result<()> {
        if self.betas.is_empty() {
            return Err(Error::config("num_steps", "schedule has no steps"));
        }

        if let Some((i, beta)) = self
            .betas
            .iter()
            .enumerate()
            .find(|(_, b)| !(**b > 0.0 && **b < 1.0))
        {
            return Err(Error::config(
                "beta",
                format!("beta_{} = {beta} is outside (0, 1)", i + 1),
            ));
        }

        if let Some(i) = self.gammas.windows(2).position(|w| w[1] >= w[0]) {
            return Err(Error::config(
                "gamma",
                format!("gamma is not strictly decreasing at step {}", i + 1),
            ));
        }

        Ok(())
    }

    /// Number of diffusion steps `T`.
    #[must_use]
    pub fn num_steps(&self) -> usize {
        self.betas.len()
    }

    /// Noise variance added at step `t` (1-based).
    ///
    /// # Panics
    ///
    /// Panics if `t` is not in `[1, T]`.
    #[must_use]
    pub fn beta(&self, t: usize) -> f64 {
        assert!(t >= 1, "beta is defined for t >= 1");
        self.betas[t - 1]
    }

    /// `1 - beta(t)`.
    ///
    /// # Panics
    ///
    /// Panics if `t` is not in `[1, T]`.
    #[must_use]
    pub fn alpha(&self, t: usize) -> f64 {
        1.0 - self.beta(t)
    }

    /// Cumulative signal retention at step `t` (0-based, `gamma(0) == 1`).
    ///
    /// # Panics
    ///
    /// Panics if `t > T`.
    #[must_use]
    pub fn gamma(&self, t: usize) -> f64 {
        self.gammas[t]
    }

    /// All betas, `beta_1..beta_T`.
    #[must_use]
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// All gammas, `gamma_0..gamma_T`.
    #[must_use]
    pub fn gammas(&self) -> &[f64] {
        &self.gammas
    }

    /// Coefficients of the forward-process posterior at step `t`.
    ///
    /// # Panics
    ///
    /// Panics if `t` is not in `[1, T]`.
    #[must_use]
    pub fn posterior(&self, t: usize) -> Posterior {
        let beta = self.beta(t);
        let gamma = self.gamma(t);
        let gamma_prev = self.gamma(t - 1);
        let denom = 1.0 - gamma;

        Posterior {
            x0_coef: beta * gamma_prev.sqrt() / denom,
            xt_coef: (1.0 - gamma_prev) * self.alpha(t).sqrt() / denom,
            variance: beta * (1.0 - gamma_prev) / denom,
        }
    }

    /// Stable 64-bit digest of the coefficients.
    ///
    /// Used to reject checkpoints produced under a different schedule.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        // FNV-1a over the little-endian bit patterns.
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0100_0000_01b3;

        self.betas
            .iter()
            .flat_map(|b| b.to_bits().to_le_bytes())
            .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
    }

    /// Derive a shorter schedule for accelerated sampling.
    ///
    /// The policy picks `steps` of the original steps; the new schedule keeps
    /// their gammas and recomputes betas so the chain stays a valid Markov
    /// chain. Asking for all `T` steps returns an identical schedule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `steps` is zero or exceeds `T`, or if the
    /// policy returns an invalid selection.
    pub fn respace(&self, policy: &dyn SkipPolicy, steps: usize) -> Result<Self> {
        let total = self.num_steps();
        if steps == 0 || steps > total {
            return Err(Error::config(
                "sampling_steps",
                format!("must be in [1, {total}], got {steps}"),
            ));
        }

        if steps == total {
            return Ok(self.clone());
        }

        let selected = policy.select(total, steps);
        respace::check_selection(&selected, total, steps)?;

        let mut gammas = Vec::with_capacity(steps + 1);
        gammas.push(1.0);
        gammas.extend(selected.iter().map(|&t| self.gammas[t]));

        tracing::debug!("Respaced schedule from {total} to {steps} steps");

        Self::from_gammas(gammas)
    }
}

#[allow(clippy::cast_precision_loss)]
fn linear_betas(config: &ScheduleConfig) -> Vec<f64> {
    let n = config.num_steps;
    if n == 1 {
        return vec![config.beta_min];
    }

    let span = config.beta_max - config.beta_min;
    let last = (n - 1) as f64;
    (0..n)
        .map(|i| span.mul_add(i as f64 / last, config.beta_min))
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn cosine_betas(num_steps: usize) -> Vec<f64> {
    let curve = |s: f64| {
        ((s + COSINE_OFFSET) / (1.0 + COSINE_OFFSET) * std::f64::consts::FRAC_PI_2)
            .cos()
            .powi(2)
    };
    let total = num_steps as f64;

    (1..=num_steps)
        .map(|i| {
            let prev = curve((i - 1) as f64 / total);
            let next = curve(i as f64 / total);
            (1.0 - next / prev).min(COSINE_MAX_BETA)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(num_steps: usize) -> ScheduleConfig {
        ScheduleConfig {
            num_steps,
            ..ScheduleConfig::default()
        }
    }

    fn cosine(num_steps: usize) -> ScheduleConfig {
        ScheduleConfig {
            kind: ScheduleKind::Cosine,
            num_steps,
            ..ScheduleConfig::default()
        }
    }

    #[test]
    fn test_gamma_endpoints_and_monotonicity() {
        for config in [linear(1000), cosine(1000), cosine(200)] {
            let schedule = DiffusionSchedule::new(&config).unwrap();
            let gammas = schedule.gammas();

            assert_eq!(gammas.len(), config.num_steps + 1);
            assert!(gammas.windows(2).all(|w| w[1] < w[0]), "{config:?}");
            assert!((gammas[0] - 1.0).abs() < 1e-3);
            assert!(gammas[config.num_steps] < 1e-3, "{config:?}");
            assert!(schedule.betas().iter().all(|b| *b > 0.0 && *b < 1.0));
        }
    }

    #[test]
    fn test_linear_endpoints() {
        let schedule = DiffusionSchedule::new(&linear(1000)).unwrap();
        assert!((schedule.beta(1) - 1e-4).abs() < 1e-12);
        assert!((schedule.beta(1000) - 0.02).abs() < 1e-12);
        assert!((schedule.alpha(1) - (1.0 - 1e-4)).abs() < 1e-12);
    }

    #[test]
    fn test_single_step_schedule() {
        let schedule = DiffusionSchedule::new(&linear(1)).unwrap();
        assert_eq!(schedule.num_steps(), 1);
        assert_eq!(schedule.beta(1), 1e-4);
    }

    #[test]
    fn test_deterministic_build() {
        let a = DiffusionSchedule::new(&cosine(500)).unwrap();
        let b = DiffusionSchedule::new(&cosine(500)).unwrap();

        let bits = |s: &DiffusionSchedule| s.gammas().iter().map(|g| g.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a), bits(&b));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_schedules() {
        let a = DiffusionSchedule::new(&linear(1000)).unwrap();
        let b = DiffusionSchedule::new(&cosine(1000)).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_invalid_configs() {
        let bad = [
            ScheduleConfig {
                num_steps: 0,
                ..ScheduleConfig::default()
            },
            ScheduleConfig {
                beta_min: 0.0,
                ..ScheduleConfig::default()
            },
            ScheduleConfig {
                beta_max: 1.0,
                ..ScheduleConfig::default()
            },
            ScheduleConfig {
                beta_min: 0.02,
                beta_max: 0.02,
                ..ScheduleConfig::default()
            },
            ScheduleConfig {
                beta_min: 0.05,
                beta_max: 0.01,
                ..ScheduleConfig::default()
            },
        ];

        for config in bad {
            assert!(
                matches!(DiffusionSchedule::new(&config), Err(Error::Config { .. })),
                "{config:?}"
            );
        }
    }

    #[test]
    fn test_schedule_kind_parsing() {
        assert_eq!("linear".parse::<ScheduleKind>().unwrap(), ScheduleKind::Linear);
        assert_eq!("Cosine".parse::<ScheduleKind>().unwrap(), ScheduleKind::Cosine);
        assert!(matches!(
            "sigmoid".parse::<ScheduleKind>(),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_posterior_first_step_returns_clean_estimate() {
        let schedule = DiffusionSchedule::new(&linear(1000)).unwrap();
        let posterior = schedule.posterior(1);

        assert!((posterior.x0_coef - 1.0).abs() < 1e-9);
        assert!(posterior.xt_coef.abs() < 1e-12);
        assert!(posterior.variance.abs() < 1e-12);
    }

    #[test]
    fn test_posterior_variance_bounded_by_beta() {
        let schedule = DiffusionSchedule::new(&cosine(100)).unwrap();
        for t in 2..=100 {
            let posterior = schedule.posterior(t);
            assert!(posterior.variance > 0.0);
            assert!(posterior.variance <= schedule.beta(t));
        }
    }

    #[test]
    fn test_respace_keeps_terminal_gamma() {
        let schedule = DiffusionSchedule::new(&linear(1000)).unwrap();

        for kind in [SkipKind::Uniform, SkipKind::Quadratic] {
            let short = schedule.respace(&kind, 50).unwrap();
            assert_eq!(short.num_steps(), 50);
            assert_eq!(short.gamma(50), schedule.gamma(1000));
            assert!(short.gammas().windows(2).all(|w| w[1] < w[0]));
        }
    }

    #[test]
    fn test_respace_full_length_is_identity() {
        let schedule = DiffusionSchedule::new(&cosine(100)).unwrap();
        let same = schedule.respace(&SkipKind::Uniform, 100).unwrap();
        assert_eq!(same, schedule);
    }

    #[test]
    fn test_respace_rejects_out_of_range() {
        let schedule = DiffusionSchedule::new(&linear(10)).unwrap();
        assert!(schedule.respace(&SkipKind::Uniform, 0).is_err());
        assert!(schedule.respace(&SkipKind::Uniform, 11).is_err());
    }
}
