//! On-disk training checkpoints.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::denoiser::ParamSet;
use crate::error::{Error, Result};

use super::{Ema, OptimizerState};

const MAGIC: &[u8; 8] = b"FLSHDIFF";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = MAGIC.len() + 4;

/// Everything needed to continue a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    /// Number of completed training steps.
    pub step: u64,
    /// Fingerprint of the schedule the run was trained with.
    pub schedule_fingerprint: u64,
    /// Live model parameters.
    pub params: ParamSet,
    /// Full-precision EMA shadow.
    pub ema: Ema,
    /// Optimizer moments and step counter.
    pub optimizer: OptimizerState,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl TrainingCheckpoint {
    /// Write the checkpoint.
    ///
    /// The file is written next to `path`, flushed to disk, then renamed over
    /// `path`, so readers only ever observe a complete checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or any file operation fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|source| Error::CheckpointEncode { source })?;

        let temp = temp_path(path);
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(MAGIC)?;
            file.write_all(&FORMAT_VERSION.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
            fs::rename(&temp, path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        tracing::info!("Saved checkpoint at step {} to {}", self.step, path.display());
        Ok(())
    }

    /// Read a checkpoint written by [`TrainingCheckpoint::save`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CheckpointCorruption`] if the file is truncated, has a
    /// foreign header, or does not decode.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let corrupt = |reason: String| Error::CheckpointCorruption {
            path: path.to_path_buf(),
            reason,
        };

        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(corrupt("missing checkpoint header".to_string()));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[MAGIC.len()..HEADER_LEN]);
        let version = u32::from_le_bytes(version);
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {version}")));
        }

        let (checkpoint, read): (Self, usize) =
            bincode::serde::decode_from_slice(&bytes[HEADER_LEN..], bincode::config::standard())
                .map_err(|e| corrupt(e.to_string()))?;

        if read != bytes.len() - HEADER_LEN {
            return Err(corrupt(format!(
                "{} trailing bytes",
                bytes.len() - HEADER_LEN - read
            )));
        }

        tracing::info!("Loaded checkpoint at step {} from {}", checkpoint.step, path.display());
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn checkpoint() -> TrainingCheckpoint {
        let mut params = ParamSet::new();
        params.insert("weight", ArrayD::from_shape_fn(IxDyn(&[2, 3]), |i| i[0] as f32 - i[1] as f32));
        params.insert("bias", ArrayD::from_elem(IxDyn(&[2]), 0.25));

        TrainingCheckpoint {
            step: 42,
            schedule_fingerprint: 0xDEAD_BEEF,
            ema: Ema::new(0.999, &params),
            optimizer: OptimizerState {
                step: 42,
                buffers: [("m".to_string(), params.zeros_like())].into(),
            },
            params,
        }
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");

        let original = checkpoint();
        original.save(&path).unwrap();

        assert!(!temp_path(&path).exists());
        assert_eq!(TrainingCheckpoint::load(&path).unwrap(), original);
    }

    #[test]
    fn test_overwrite_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");

        checkpoint().save(&path).unwrap();
        let mut next = checkpoint();
        next.step = 43;
        next.save(&path).unwrap();

        assert_eq!(TrainingCheckpoint::load(&path).unwrap().step, 43);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        checkpoint().save(&path).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(
            TrainingCheckpoint::load(&path),
            Err(Error::CheckpointCorruption { .. })
        ));
    }

    #[test]
    fn test_foreign_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"not a checkpoint at all").unwrap();

        assert!(matches!(
            TrainingCheckpoint::load(&path),
            Err(Error::CheckpointCorruption { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            TrainingCheckpoint::load(dir.path().join("absent.ckpt")),
            Err(Error::Io(_))
        ));
    }
}
