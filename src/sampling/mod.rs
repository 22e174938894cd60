//! Reverse diffusion sampling.
//!
//! The chain is an explicit state machine. [`ChainState`] holds the step index
//! `t` and the current estimate `x_t`; [`ReverseSampler::transition`] maps
//! `x_t` to `x_{t-1}`; the chain is terminal at `t = 0`. Each transition
//! depends on the previous one, so a chain runs strictly in order, while
//! independent chains (batches, tiles) may run concurrently.

use std::borrow::Cow;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Zip;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::conditioning::ConditioningBundle;
use crate::denoiser::{predict_checked, Denoiser};
use crate::error::{Error, Result};
use crate::forward::standard_normal;
use crate::image::{ImageTensor, RGB_CHANNELS};
use crate::schedule::{DiffusionSchedule, SkipKind};

/// Pixel range the clean estimate is clipped to.
const CLIP_RANGE: f32 = 1.0;

/// Fixed (never learned) variance of each reverse transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariancePolicy {
    /// True posterior variance `beta_t (1 - gamma_{t-1}) / (1 - gamma_t)`.
    #[default]
    Posterior,
    /// Forward-process variance `beta_t`.
    Beta,
}

impl VariancePolicy {
    fn variance(self, schedule: &DiffusionSchedule, t: usize) -> f64 {
        match self {
            Self::Posterior => schedule.posterior(t).variance,
            Self::Beta => schedule.beta(t),
        }
    }
}

/// Configuration for reverse sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Number of reverse steps. `None` runs the full training schedule.
    pub sampling_steps: Option<usize>,

    /// How steps are chosen when `sampling_steps` is below `T`.
    pub skip: SkipKind,

    /// Variance of each reverse transition.
    pub variance: VariancePolicy,

    /// Channels of the generated image.
    pub output_channels: usize,

    /// Keep every intermediate `x_t`.
    pub keep_trajectory: bool,

    /// Show a progress bar while sampling.
    pub show_progress: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sampling_steps: None,
            skip: SkipKind::Uniform,
            variance: VariancePolicy::Posterior,
            output_channels: RGB_CHANNELS,
            keep_trajectory: false,
            show_progress: false,
        }
    }
}

impl SamplingConfig {
    /// Validate the configuration against the training schedule length.
    ///
    /// # Errors
    ///
    /// Returns an error if `sampling_steps` is zero or exceeds `num_train_steps`,
    /// or if `output_channels` is zero.
    pub fn validate(&self, num_train_steps: usize) -> Result<()> {
        if let Some(steps) = self.sampling_steps {
            if steps == 0 || steps > num_train_steps {
                return Err(Error::config(
                    "sampling_steps",
                    format!("must be in [1, {num_train_steps}], got {steps}"),
                ));
            }
        }

        if self.output_channels == 0 {
            return Err(Error::config("output_channels", "must be greater than 0"));
        }

        Ok(())
    }
}

/// One state of the reverse chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    /// Remaining steps; `0` is terminal.
    pub t: usize,
    /// Current estimate `x_t`.
    pub x: ImageTensor,
}

impl ChainState {
    /// Whether the chain has produced its final image.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.t == 0
    }
}

/// Result of a full reverse chain.
#[derive(Debug, Clone)]
pub struct SampleOutput {
    /// Final image `x_0`, values in [-1, 1].
    pub image: ImageTensor,
    /// `x_T, x_{T-1}, ..., x_0` when trajectories are kept.
    pub trajectory: Option<Vec<ImageTensor>>,
}

/// Runs the conditional reverse chain with a fixed-variance policy.
pub struct ReverseSampler<'a, D: Denoiser + ?Sized> {
    schedule: Cow<'a, DiffusionSchedule>,
    denoiser: &'a D,
    config: SamplingConfig,
}

impl<'a, D: Denoiser + ?Sized> ReverseSampler<'a, D> {
    /// Create a sampler over `schedule`, respaced if the configuration asks
    /// for fewer steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        schedule: &'a DiffusionSchedule,
        denoiser: &'a D,
        config: &SamplingConfig,
    ) -> Result<Self> {
        config.validate(schedule.num_steps())?;

        let schedule = match config.sampling_steps {
            Some(steps) if steps < schedule.num_steps() => {
                Cow::Owned(schedule.respace(&config.skip, steps)?)
            }
            _ => Cow::Borrowed(schedule),
        };

        Ok(Self {
            schedule,
            denoiser,
            config: config.clone(),
        })
    }

    /// Schedule the chain runs on.
    #[must_use]
    pub fn schedule(&self) -> &DiffusionSchedule {
        &self.schedule
    }

    /// Sampling configuration.
    #[must_use]
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Initial state: pure Gaussian noise at `t = T`.
    pub fn init<R: Rng + ?Sized>(
        &self,
        shape: (usize, usize, usize, usize),
        rng: &mut R,
    ) -> ChainState {
        ChainState {
            t: self.schedule.num_steps(),
            x: standard_normal(shape, rng),
        }
    }

    /// Clean estimate and posterior mean at step `t` given the predicted noise.
    ///
    /// # Panics
    ///
    /// Panics if `t` is not in `[1, T]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn posterior_mean(
        &self,
        x_t: &ImageTensor,
        predicted_noise: &ImageTensor,
        t: usize,
    ) -> (ImageTensor, ImageTensor) {
        let gamma = self.schedule.gamma(t);
        let recip_signal = (1.0 / gamma.sqrt()) as f32;
        let spread = (1.0 - gamma).sqrt() as f32;

        let x0_hat = Zip::from(x_t)
            .and(predicted_noise)
            .map_collect(|&x, &eps| ((x - spread * eps) * recip_signal).clamp(-CLIP_RANGE, CLIP_RANGE));

        let posterior = self.schedule.posterior(t);
        let (c0, ct) = (posterior.x0_coef as f32, posterior.xt_coef as f32);
        let mean = Zip::from(&x0_hat)
            .and(x_t)
            .map_collect(|&x0, &x| c0 * x0 + ct * x);

        (x0_hat, mean)
    }

    /// Advance the chain by one step, `x_t → x_{t-1}`.
    ///
    /// Noise is added on every transition except the one producing `x_0`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainAborted`] if the denoiser fails and
    /// [`Error::NumericInstability`] if the new state is not finite.
    ///
    /// # Panics
    ///
    /// Panics if `state` is already terminal.
    #[allow(clippy::cast_possible_truncation)]
    pub fn transition<R: Rng + ?Sized>(
        &self,
        state: ChainState,
        conditioning: &ConditioningBundle,
        rng: &mut R,
    ) -> Result<ChainState> {
        assert!(!state.is_terminal(), "transition from terminal state");
        let t = state.t;

        let gammas = vec![self.schedule.gamma(t) as f32; state.x.dim().0];
        let predicted = predict_checked(self.denoiser, &state.x, conditioning, &gammas).map_err(
            |source| Error::ChainAborted {
                step: t,
                source: Box::new(source),
            },
        )?;

        let (_, mut x) = self.posterior_mean(&state.x, &predicted, t);

        if t > 1 {
            let sigma = self.config.variance.variance(&self.schedule, t).sqrt() as f32;
            let noise = standard_normal(x.dim(), rng);
            x.scaled_add(sigma, &noise);
        }

        if !x.iter().all(|v| v.is_finite()) {
            return Err(Error::NumericInstability {
                step: t as u64,
                quantity: format!("x_{}", t - 1),
            });
        }

        Ok(ChainState { t: t - 1, x })
    }

    /// Run the full chain from pure noise, seeded deterministically.
    ///
    /// # Errors
    ///
    /// Returns an error if the conditioning is empty, the denoiser fails, or
    /// the chain becomes non-finite. The whole chain is aborted on error.
    pub fn sample(&self, conditioning: &ConditioningBundle, seed: u64) -> Result<SampleOutput> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (h, w) = conditioning.spatial();
        let shape = (conditioning.batch_size(), self.config.output_channels, h, w);

        let total = self.schedule.num_steps();
        tracing::debug!("Sampling {shape:?} over {total} steps (seed {seed})");

        let pb = if self.config.show_progress {
            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} Denoising [{bar:40.cyan/blue}] {pos}/{len}")
                    .expect("valid template")
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut state = self.init(shape, &mut rng);
        let mut trajectory = self
            .config
            .keep_trajectory
            .then(|| vec![state.x.clone()]);

        while !state.is_terminal() {
            state = self.transition(state, conditioning, &mut rng)?;
            if let Some(trajectory) = trajectory.as_mut() {
                trajectory.push(state.x.clone());
            }
            pb.inc(1);
        }

        pb.finish_with_message("Denoising complete");

        Ok(SampleOutput {
            image: state.x,
            trajectory,
        })
    }
}
