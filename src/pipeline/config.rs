//! Run configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sampling::SamplingConfig;
use crate::schedule::ScheduleConfig;
use crate::tiling::TilingConfig;
use crate::training::TrainingConfig;

/// Configuration for training and retouching runs.
///
/// Every section has defaults, so a JSON file only needs the values it
/// changes:
///
/// ```json
/// {
///   "schedule": { "kind": "cosine", "num_steps": 1000 },
///   "sampling": { "sampling_steps": 50, "skip": "quadratic" },
///   "tiling": { "tile_size": 384, "overlap": 48 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schedule: ScheduleConfig,

    pub training: TrainingConfig,

    pub sampling: SamplingConfig,

    pub tiling: TilingConfig,

    /// Output JPEG quality (1-100).
    pub output_quality: u8,

    /// Random seed for reproducibility. None for random.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            training: TrainingConfig::default(),
            sampling: SamplingConfig::default(),
            tiling: TilingConfig::default(),
            output_quality: 95,
            seed: None,
        }
    }
}

impl Config {
    /// Read a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or holds
    /// invalid values.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        tracing::debug!("Loaded configuration from {}: {config:?}", path.display());
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;
        self.training.validate()?;
        self.sampling.validate(self.schedule.num_steps)?;
        self.tiling.validate()?;

        if !(1..=100).contains(&self.output_quality) {
            return Err(Error::config("output_quality", "must be between 1 and 100"));
        }

        Ok(())
    }
}
