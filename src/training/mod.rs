//! Training step engine.
//!
//! One call to [`Trainer::step`] corrupts a batch at randomly drawn gammas,
//! scores the denoiser's noise prediction, synchronizes gradients with the
//! other workers, applies the optimizer and updates the EMA copy. The trainer
//! either commits all of that or none of it.

mod checkpoint;
mod ema;
mod loss;
mod optim;

pub use checkpoint::TrainingCheckpoint;
pub use ema::Ema;
pub use loss::LossKind;
pub use optim::{Adam, AdamConfig, Optimizer, OptimizerState};

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::conditioning::ConditioningBundle;
use crate::denoiser::{predict_checked, TrainableDenoiser};
use crate::distributed::{Collective, Reduction};
use crate::error::{Error, Result};
use crate::forward::corrupt;
use crate::image::ImageTensor;
use crate::schedule::DiffusionSchedule;

/// Spreads step seeds apart.
const STEP_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// EMA decay rate in `[0, 1]`.
    pub ema_decay: f64,

    /// Loss on predicted vs. reference noise.
    pub loss_kind: LossKind,

    /// Maximum global gradient norm, applied before reduction.
    pub grad_clip: Option<f64>,

    /// Optimizer learning rate.
    pub learning_rate: f64,

    /// Write a checkpoint every this many steps. `0` disables periodic
    /// checkpoints.
    pub checkpoint_every: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            ema_decay: 0.9999,
            loss_kind: LossKind::L2,
            grad_clip: Some(1.0),
            learning_rate: 1e-4,
            checkpoint_every: 1000,
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(Error::config(
                "ema_decay",
                format!("must be in [0, 1], got {}", self.ema_decay),
            ));
        }

        if let Some(clip) = self.grad_clip {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(Error::config(
                    "grad_clip",
                    format!("must be positive, got {clip}"),
                ));
            }
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config(
                "learning_rate",
                format!("must be positive, got {}", self.learning_rate),
            ));
        }

        Ok(())
    }
}

/// One batch of training data.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// Clean retouched targets, `[N, C, H, W]` in `[-1, 1]`.
    pub target: ImageTensor,
    /// Ambient/flash/mask inputs aligned with `target`.
    pub conditioning: ConditioningBundle,
}

/// Outcome of a committed training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Step counter after the commit.
    pub step: u64,
    /// Loss averaged over all workers.
    pub loss: f64,
    /// This worker's gradient norm before clipping.
    pub grad_norm: f64,
}

/// Per-step generator: identical for a resumed and an uninterrupted run.
fn step_rng(seed: u64, rank: usize, step: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ step.wrapping_mul(STEP_SEED_STRIDE));
    rng.set_stream(rank as u64);
    rng
}

/// Drives training of a [`TrainableDenoiser`].
pub struct Trainer<'a, M, O, C>
where
    M: TrainableDenoiser,
    O: Optimizer,
    C: Collective,
{
    schedule: &'a DiffusionSchedule,
    model: M,
    optimizer: O,
    ema: Ema,
    collective: C,
    config: TrainingConfig,
    seed: u64,
    step: u64,
}

impl<'a, M, O, C> Trainer<'a, M, O, C>
where
    M: TrainableDenoiser,
    O: Optimizer,
    C: Collective,
{
    /// Create a trainer.
    ///
    /// Rank 0's parameters are broadcast to every worker, so all workers start
    /// from identical weights. The EMA starts as a copy of those weights. The
    /// optimizer runs at `config.learning_rate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the broadcast fails.
    pub fn new(
        schedule: &'a DiffusionSchedule,
        mut model: M,
        mut optimizer: O,
        collective: C,
        config: TrainingConfig,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        collective.broadcast(model.parameters_mut())?;
        optimizer.set_learning_rate(config.learning_rate);

        tracing::info!(
            "Trainer ready: rank {}/{}, {} parameters, {} loss, learning rate {}, EMA decay {}",
            collective.rank(),
            collective.world_size(),
            model.parameters().num_elements(),
            config.loss_kind,
            config.learning_rate,
            config.ema_decay
        );

        Ok(Self {
            schedule,
            ema: Ema::new(config.ema_decay, model.parameters()),
            model,
            optimizer,
            collective,
            config,
            seed,
            step: 0,
        })
    }

    /// Number of committed steps.
    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.step
    }

    /// The live model.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The EMA shadow parameters.
    #[must_use]
    pub fn ema(&self) -> &Ema {
        &self.ema
    }

    /// Training configuration.
    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// A copy of the model carrying the EMA parameters, for inference.
    #[must_use]
    pub fn ema_denoiser(&self) -> M {
        let mut model = self.model.clone();
        *model.parameters_mut() = self.ema.shadow();
        model
    }

    /// Run one training step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NumericInstability`] if the reduced loss, gradients or
    /// updated parameters are not finite, [`Error::LockstepViolation`] if the
    /// workers disagree on the step, or any error raised by the denoiser. In
    /// every error case the trainer state is unchanged.
    pub fn step(&mut self, batch: &TrainingBatch) -> Result<StepReport> {
        let local = self.local_gradients(batch);
        self.synchronize(local)
    }

    /// Loss and clipped gradients of this worker's share of the batch.
    fn local_gradients(&self, batch: &TrainingBatch) -> Result<(Reduction, f64)> {
        let conditioning = &batch.conditioning;
        conditioning.check_aligned(&batch.target)?;

        let mut rng = step_rng(self.seed, self.collective.rank(), self.step);
        let gammas: Vec<f64> = (0..batch.target.dim().0)
            .map(|_| self.schedule.sample_training_gamma(&mut rng))
            .collect();
        let sample = corrupt(&batch.target, &gammas, &mut rng)?;

        let prediction = predict_checked(&self.model, &sample.noisy, conditioning, &sample.gammas)?;
        let (loss, grad_output) = self.config.loss_kind.evaluate(&prediction, &sample.noise)?;
        let mut grads =
            self.model
                .gradients(&sample.noisy, conditioning, &sample.gammas, &grad_output)?;

        let grad_norm = match self.config.grad_clip {
            Some(max_norm) => grads.clip_global_norm(max_norm),
            None => grads.global_norm(),
        };

        Ok((Reduction { loss, grads }, grad_norm))
    }

    /// Reduce with the other workers, then apply the update.
    ///
    /// A local failure still takes part in the reduction so that the other
    /// workers are released from the barrier.
    fn synchronize(&mut self, local: Result<(Reduction, f64)>) -> Result<StepReport> {
        let (contribution, grad_norm, failure) = match local {
            Ok((reduction, norm)) => (reduction, norm, None),
            Err(e) => (Reduction::poisoned(self.model.parameters()), f64::NAN, Some(e)),
        };

        let reduced = self.collective.all_reduce(self.step, contribution);
        if let Some(e) = failure {
            return Err(e);
        }
        let reduced = reduced?;

        let unstable = |quantity: &str| Error::NumericInstability {
            step: self.step,
            quantity: quantity.to_string(),
        };
        if !reduced.loss.is_finite() {
            return Err(unstable("loss"));
        }
        if !reduced.grads.is_finite() {
            return Err(unstable("gradients"));
        }

        let mut params = self.model.parameters().clone();
        let mut optimizer = self.optimizer.clone();
        optimizer.step(&mut params, &reduced.grads)?;
        if !params.is_finite() {
            return Err(unstable("parameters"));
        }

        *self.model.parameters_mut() = params;
        self.optimizer = optimizer;
        self.ema.update(self.model.parameters());
        self.step += 1;

        tracing::debug!(
            "Step {}: loss {:.6}, grad norm {:.4}",
            self.step,
            reduced.loss,
            grad_norm
        );

        Ok(StepReport {
            step: self.step,
            loss: reduced.loss,
            grad_norm,
        })
    }

    /// Train until `batches` runs out or `max_steps` steps are committed.
    ///
    /// When `checkpoint_path` is set, rank 0 writes a checkpoint every
    /// `checkpoint_every` steps and once more at the end.
    ///
    /// # Errors
    ///
    /// Returns the first batch, step or checkpoint error.
    pub fn fit<I>(
        &mut self,
        batches: I,
        max_steps: u64,
        checkpoint_path: Option<&Path>,
    ) -> Result<Option<StepReport>>
    where
        I: IntoIterator<Item = Result<TrainingBatch>>,
    {
        let mut last = None;
        let mut batches = batches.into_iter();

        while self.step < max_steps {
            let Some(batch) = batches.next() else {
                break;
            };
            let local = batch.and_then(|batch| self.local_gradients(&batch));
            let report = self.synchronize(local)?;

            if let Some(path) = checkpoint_path {
                let every = self.config.checkpoint_every;
                if every > 0 && report.step % every == 0 {
                    self.write_checkpoint(path)?;
                }
            }
            last = Some(report);
        }

        if let Some(report) = last {
            tracing::info!(
                "Training stopped at step {} with loss {:.6}",
                report.step,
                report.loss
            );
            if let Some(path) = checkpoint_path {
                let every = self.config.checkpoint_every;
                if every == 0 || report.step % every != 0 {
                    self.write_checkpoint(path)?;
                }
            }
        }

        Ok(last)
    }

    fn write_checkpoint(&self, path: &Path) -> Result<()> {
        if self.collective.rank() == 0 {
            self.checkpoint().save(path)?;
        }
        Ok(())
    }

    /// Snapshot of the complete training state.
    #[must_use]
    pub fn checkpoint(&self) -> TrainingCheckpoint {
        TrainingCheckpoint {
            step: self.step,
            schedule_fingerprint: self.schedule.fingerprint(),
            params: self.model.parameters().clone(),
            ema: self.ema.clone(),
            optimizer: self.optimizer.state(),
        }
    }

    /// Continue from a checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CheckpointCorruption`] if the checkpoint cannot be
    /// read, was trained with a different schedule, or does not fit the
    /// model. The trainer is unchanged on error.
    pub fn resume<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let checkpoint = TrainingCheckpoint::load(path)?;
        let corrupt = |reason: String| Error::CheckpointCorruption {
            path: PathBuf::from(path),
            reason,
        };

        let fingerprint = self.schedule.fingerprint();
        if checkpoint.schedule_fingerprint != fingerprint {
            return Err(corrupt(format!(
                "schedule fingerprint {:#018x} does not match {fingerprint:#018x}",
                checkpoint.schedule_fingerprint
            )));
        }

        let layout = self.model.parameters();
        if !checkpoint.params.same_layout(layout) || !checkpoint.ema.same_layout(layout) {
            return Err(corrupt("parameter layout does not match the model".to_string()));
        }

        let mut optimizer = self.optimizer.clone();
        optimizer
            .load_state(checkpoint.optimizer)
            .map_err(|e| corrupt(e.to_string()))?;

        *self.model.parameters_mut() = checkpoint.params;
        self.ema = checkpoint.ema.with_decay(self.config.ema_decay);
        self.optimizer = optimizer;
        self.step = checkpoint.step;

        tracing::info!("Resumed training at step {}", self.step);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use ndarray::{ArrayD, IxDyn};

    use super::*;
    use crate::denoiser::{AffineDenoiser, ParamSet};
    use crate::distributed::{LocalGroup, SingleProcess};
    use crate::schedule::ScheduleConfig;

    fn schedule() -> DiffusionSchedule {
        DiffusionSchedule::new(&ScheduleConfig {
            num_steps: 100,
            ..ScheduleConfig::default()
        })
        .unwrap()
    }

    fn batch(offset: usize) -> TrainingBatch {
        let ambient = ImageTensor::from_shape_fn((4, 3, 6, 6), |(n, c, y, x)| {
            ((n + offset + c * 2 + y * 3 + x * 5) % 9) as f32 / 9.0 - 0.5
        });
        let flash = ambient.mapv(|v| (v * 1.5).clamp(-1.0, 1.0));
        let target = (&ambient + &flash).mapv(|v| v * 0.5);
        TrainingBatch {
            target,
            conditioning: ConditioningBundle::new(ambient, flash, Some(ImageTensor::zeros((4, 1, 6, 6))))
                .unwrap(),
        }
    }

    fn config() -> TrainingConfig {
        TrainingConfig {
            ema_decay: 0.9,
            learning_rate: 1e-2,
            ..TrainingConfig::default()
        }
    }

    fn trainer(schedule: &DiffusionSchedule) -> Trainer<'_, AffineDenoiser, Adam, SingleProcess> {
        Trainer::new(
            schedule,
            AffineDenoiser::new(3, 7),
            Adam::new(1e-2),
            SingleProcess,
            config(),
            7,
        )
        .unwrap()
    }

    #[test]
    fn test_loss_decreases() {
        let schedule = schedule();
        let mut trainer = trainer(&schedule);

        let losses: Vec<f64> = (0..300)
            .map(|i| trainer.step(&batch(i % 5)).unwrap().loss)
            .collect();

        let early = losses[..20].iter().sum::<f64>() / 20.0;
        let late = losses[280..].iter().sum::<f64>() / 20.0;
        assert!(late < 0.8 * early, "early {early}, late {late}");
        assert_eq!(trainer.global_step(), 300);
    }

    #[test]
    fn test_training_is_reproducible() {
        let schedule = schedule();
        let mut a = trainer(&schedule);
        let mut b = trainer(&schedule);

        for i in 0..5 {
            assert_eq!(a.step(&batch(i)).unwrap(), b.step(&batch(i)).unwrap());
        }
        assert_eq!(a.model().parameters(), b.model().parameters());
    }

    #[test]
    fn test_failed_step_leaves_state_untouched() {
        let schedule = schedule();
        let mut trainer = trainer(&schedule);
        trainer.step(&batch(0)).unwrap();
        let before = trainer.checkpoint();

        let mut poisoned = batch(1);
        poisoned.target[[0, 0, 0, 0]] = f32::NAN;
        assert!(matches!(
            trainer.step(&poisoned),
            Err(Error::NumericInstability { step: 1, .. })
        ));

        let mut misaligned = batch(1);
        misaligned.target = ImageTensor::zeros((4, 3, 5, 6));
        assert!(trainer.step(&misaligned).is_err());

        assert_eq!(trainer.checkpoint(), before);
    }

    #[test]
    fn test_ema_tracks_live_parameters() {
        let schedule = schedule();
        let mut trainer = Trainer::new(
            &schedule,
            AffineDenoiser::new(3, 7),
            Adam::new(1e-2),
            SingleProcess,
            TrainingConfig {
                ema_decay: 0.0,
                ..config()
            },
            3,
        )
        .unwrap();
        trainer.step(&batch(0)).unwrap();

        assert_eq!(trainer.ema_denoiser().parameters(), trainer.model().parameters());
        assert_ne!(trainer.model().parameters(), AffineDenoiser::new(3, 7).parameters());
    }

    #[test]
    fn test_learning_rate_drives_update() {
        let schedule = schedule();
        let step_with = |learning_rate: f64| {
            let mut trainer = Trainer::new(
                &schedule,
                AffineDenoiser::new(3, 7),
                Adam::new(1e-2),
                SingleProcess,
                TrainingConfig {
                    learning_rate,
                    ..config()
                },
                7,
            )
            .unwrap();
            trainer.step(&batch(0)).unwrap();
            trainer.model().parameters().clone()
        };

        let initial = AffineDenoiser::new(3, 7).parameters().clone();
        let delta = |params: &ParamSet| {
            params
                .iter()
                .zip(initial.iter())
                .flat_map(|((_, a), (_, b))| a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()))
                .fold(0.0_f32, f32::max)
        };

        let slow = delta(&step_with(1e-6));
        let fast = delta(&step_with(0.5));
        assert!(slow < 1e-5, "slow step moved {slow}");
        assert!(fast > 0.1, "fast step moved {fast}");
    }

    #[test]
    fn test_resume_continues_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.ckpt");
        let schedule = schedule();

        let mut uninterrupted = trainer(&schedule);
        for i in 0..2 {
            uninterrupted.step(&batch(i)).unwrap();
        }
        uninterrupted.checkpoint().save(&path).unwrap();
        let expected: Vec<_> = (2..4).map(|i| uninterrupted.step(&batch(i)).unwrap()).collect();

        let mut resumed = trainer(&schedule);
        resumed.resume(&path).unwrap();
        assert_eq!(resumed.global_step(), 2);
        let actual: Vec<_> = (2..4).map(|i| resumed.step(&batch(i)).unwrap()).collect();

        assert_eq!(actual, expected);
        assert_eq!(resumed.checkpoint(), uninterrupted.checkpoint());
    }

    #[test]
    fn test_resume_rejects_other_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.ckpt");
        let schedule = schedule();
        trainer(&schedule).checkpoint().save(&path).unwrap();

        let other = DiffusionSchedule::new(&ScheduleConfig {
            num_steps: 50,
            ..ScheduleConfig::default()
        })
        .unwrap();
        let mut trainer = trainer(&other);

        assert!(matches!(
            trainer.resume(&path),
            Err(Error::CheckpointCorruption { .. })
        ));
        assert_eq!(trainer.global_step(), 0);
    }

    #[test]
    fn test_fit_writes_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.ckpt");
        let schedule = schedule();
        let mut trainer = Trainer::new(
            &schedule,
            AffineDenoiser::new(3, 7),
            Adam::new(1e-2),
            SingleProcess,
            TrainingConfig {
                checkpoint_every: 4,
                ..config()
            },
            11,
        )
        .unwrap();

        let report = trainer
            .fit((0..100).map(|i| Ok(batch(i))), 6, Some(&path))
            .unwrap()
            .unwrap();

        assert_eq!(report.step, 6);
        assert_eq!(TrainingCheckpoint::load(&path).unwrap().step, 6);
    }

    #[test]
    fn test_fit_propagates_batch_errors() {
        let schedule = schedule();
        let mut trainer = trainer(&schedule);
        let batches = vec![
            Ok(batch(0)),
            Err(Error::DenoiserCompute {
                reason: "decode failed".to_string(),
            }),
        ];

        assert!(trainer.fit(batches, 10, None).is_err());
        assert_eq!(trainer.global_step(), 1);
    }

    #[test]
    fn test_invalid_config() {
        for config in [
            TrainingConfig { ema_decay: 1.5, ..TrainingConfig::default() },
            TrainingConfig { grad_clip: Some(0.0), ..TrainingConfig::default() },
            TrainingConfig { learning_rate: f64::NAN, ..TrainingConfig::default() },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_workers_stay_in_sync() {
        let schedule = schedule();
        let group = LocalGroup::new(2).unwrap();

        let params: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = group
                .into_iter()
                .map(|member| {
                    let schedule = &schedule;
                    s.spawn(move || {
                        let mut model = AffineDenoiser::new(3, 7);
                        // Diverging starting points are overwritten by rank 0's.
                        model.parameters_mut().insert(
                            "bias",
                            ArrayD::from_elem(IxDyn(&[3]), member.rank() as f32),
                        );
                        let rank = member.rank();
                        let mut trainer =
                            Trainer::new(schedule, model, Adam::new(1e-2), member, config(), 5).unwrap();
                        for i in 0..3 {
                            trainer.step(&batch(i + rank)).unwrap();
                        }
                        trainer.model().parameters().clone()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(params[0], params[1]);
    }
}
