//! # flashdiff
//!
//! A conditional denoising diffusion engine for retouching paired ambient and
//! flash exposures.
//!
//! The crate provides the noise schedule, the forward corruption process, the
//! training step with EMA and gradient synchronization, and the reverse
//! sampler, together with a tiling layer that runs the sampler on images
//! larger than the denoiser's operating size. The denoising network itself is
//! an external collaborator behind the [`Denoiser`] trait.
//!
//! ## Example
//!
//! ```no_run
//! use flashdiff::{Config, Pipeline};
//!
//! # fn main() -> flashdiff::Result<()> {
//! let config = Config::default();
//! let pipeline = Pipeline::from_onnx(config, "denoiser.onnx")?;
//!
//! pipeline.process("ambient.jpg", "flash.jpg", None, "retouched.png")?;
//! # Ok(())
//! # }
//! ```

pub mod conditioning;
pub mod denoiser;
pub mod distributed;
pub mod error;
pub mod forward;
pub mod image;
pub mod pipeline;
pub mod sampling;
pub mod schedule;
pub mod tiling;
pub mod training;

pub use conditioning::ConditioningBundle;
pub use denoiser::{AffineDenoiser, Denoiser, OnnxDenoiser, ParamSet, TrainableDenoiser};
pub use distributed::{Collective, LocalGroup, SingleProcess};
pub use error::{Error, Result};
pub use pipeline::{Config, Pipeline};
pub use sampling::{ReverseSampler, SamplingConfig};
pub use schedule::{DiffusionSchedule, ScheduleConfig, ScheduleKind};
pub use tiling::{TiledSampler, TilingConfig};
pub use training::{Trainer, TrainingBatch, TrainingConfig};
