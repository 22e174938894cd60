//! End-to-end retouching pipeline.

use std::path::Path;

use crate::conditioning::ConditioningBundle;
use crate::denoiser::{Denoiser, OnnxDenoiser};
use crate::error::Result;
use crate::image::{self, ImageTensor};
use crate::schedule::DiffusionSchedule;
use crate::tiling::TiledSampler;

use super::Config;

/// Retouches ambient/flash pairs with a trained denoiser.
pub struct Pipeline<D: Denoiser = OnnxDenoiser> {
    config: Config,
    schedule: DiffusionSchedule,
    denoiser: D,
}

impl Pipeline<OnnxDenoiser> {
    /// Create a pipeline around an exported ONNX denoiser.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the model cannot
    /// be loaded.
    pub fn from_onnx<P: AsRef<Path>>(config: Config, model_path: P) -> Result<Self> {
        config.validate()?;
        let denoiser = OnnxDenoiser::load(model_path)?;
        Self::new(config, denoiser)
    }
}

impl<D: Denoiser> Pipeline<D> {
    /// Create a new pipeline with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config, denoiser: D) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing pipeline with config: {config:?}");
        let schedule = DiffusionSchedule::new(&config.schedule)?;

        Ok(Self {
            config,
            schedule,
            denoiser,
        })
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Noise schedule built from the configuration.
    #[must_use]
    pub fn schedule(&self) -> &DiffusionSchedule {
        &self.schedule
    }

    /// Generate retouched images for an in-memory bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling fails.
    pub fn retouch(&self, conditioning: &ConditioningBundle, seed: u64) -> Result<ImageTensor> {
        let sampler = TiledSampler::new(
            &self.schedule,
            &self.denoiser,
            &self.config.sampling,
            &self.config.tiling,
        )?;
        sampler.sample(conditioning, seed)
    }

    /// Retouch an ambient/flash pair on disk.
    ///
    /// # Arguments
    ///
    /// * `ambient` - Path to the ambient exposure
    /// * `flash` - Path to the flash exposure
    /// * `mask` - Optional highlight/window mask
    /// * `output` - Path to save the retouched image
    ///
    /// # Errors
    ///
    /// Returns an error if loading, sampling or saving fails.
    pub fn process<P: AsRef<Path>>(
        &self,
        ambient: P,
        flash: P,
        mask: Option<P>,
        output: P,
    ) -> Result<()> {
        let output = output.as_ref();

        tracing::info!("Processing pair: {}", ambient.as_ref().display());
        let conditioning = ConditioningBundle::load(ambient, flash, mask)?;

        let seed = self.config.seed.unwrap_or_else(rand::random);
        tracing::info!("Sampling with seed {seed}");
        let retouched = self.retouch(&conditioning, seed)?;

        tracing::info!("Saving output to: {}", output.display());
        image::save_image(&retouched, output, self.config.output_quality)?;

        tracing::info!("Processing complete");
        Ok(())
    }
}
