//! Tiled sampling for images larger than the denoiser's operating size.
//!
//! The image is split into overlapping tiles, each tile runs its own reverse
//! chain, and the results are blended back with linear cross-fades in the
//! overlap bands. A single tile covering the whole image reproduces the
//! untiled sampler exactly.

mod blend;

pub use blend::{tile_weights, Canvas};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::conditioning::ConditioningBundle;
use crate::denoiser::Denoiser;
use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::sampling::{ReverseSampler, SamplingConfig};
use crate::schedule::DiffusionSchedule;

/// Odd multiplier spreading tile seeds apart.
const TILE_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Tile layout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Edge length of a square tile in pixels.
    pub tile_size: usize,

    /// Overlap between neighbouring tiles in pixels.
    pub overlap: usize,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            overlap: 32,
        }
    }
}

impl TilingConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the tile size is zero or the overlap is not smaller
    /// than the tile size.
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(Error::config("tile_size", "must be greater than 0"));
        }

        if self.overlap >= self.tile_size {
            return Err(Error::config(
                "tile_overlap",
                format!(
                    "must be smaller than tile_size ({} >= {})",
                    self.overlap, self.tile_size
                ),
            ));
        }

        Ok(())
    }
}

/// A rectangular region of the image processed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Row-major position in the tile grid.
    pub index: usize,
    /// Top edge in image pixels.
    pub y: usize,
    /// Left edge in image pixels.
    pub x: usize,
    /// Height in pixels.
    pub height: usize,
    /// Width in pixels.
    pub width: usize,
    /// Width of the blend band on sides shared with a neighbour.
    pub overlap: usize,
    /// Whether the bottom edge lies on the image border.
    pub touches_bottom: bool,
    /// Whether the right edge lies on the image border.
    pub touches_right: bool,
}

/// Start offsets of tiles along one axis. The last tile is shifted to end on
/// the border so all tiles along the axis share the same length.
fn axis_starts(dim: usize, size: usize, overlap: usize) -> Vec<usize> {
    let size = size.min(dim);
    let step = (size - overlap.min(size - 1)).max(1);

    let mut starts = Vec::new();
    let mut start = 0;
    loop {
        if start + size >= dim {
            starts.push(dim - size);
            break;
        }
        starts.push(start);
        start += step;
    }
    starts
}

/// Partition an image of `height x width` into overlapping tiles.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the image is empty.
pub fn plan_tiles(height: usize, width: usize, config: &TilingConfig) -> Result<Vec<Tile>> {
    config.validate()?;
    if height == 0 || width == 0 {
        return Err(Error::shape("non-empty image", (height, width)));
    }

    let rows = axis_starts(height, config.tile_size, config.overlap);
    let cols = axis_starts(width, config.tile_size, config.overlap);
    let tile_h = config.tile_size.min(height);
    let tile_w = config.tile_size.min(width);

    let mut tiles = Vec::with_capacity(rows.len() * cols.len());
    for &y in &rows {
        for &x in &cols {
            tiles.push(Tile {
                index: tiles.len(),
                y,
                x,
                height: tile_h,
                width: tile_w,
                overlap: config.overlap,
                touches_bottom: y + tile_h == height,
                touches_right: x + tile_w == width,
            });
        }
    }

    Ok(tiles)
}

/// Seed for the tile whose top-left corner is at (`y`, `x`).
///
/// Seeds depend only on the global seed and the tile origin, so a tile keeps
/// its noise when the tile size changes. The tile at the origin uses the
/// global seed.
#[must_use]
pub fn tile_seed(seed: u64, y: usize, x: usize) -> u64 {
    let origin = ((y as u64) << 32) ^ (x as u64);
    seed.wrapping_add(origin.wrapping_mul(TILE_SEED_STRIDE))
}

/// Runs one reverse chain per tile and blends the results.
pub struct TiledSampler<'a, D: Denoiser + ?Sized> {
    sampler: ReverseSampler<'a, D>,
    tiling: TilingConfig,
    show_progress: bool,
}

impl<'a, D: Denoiser + ?Sized> TiledSampler<'a, D> {
    /// Create a tiled sampler.
    ///
    /// # Errors
    ///
    /// Returns an error if either configuration is invalid.
    pub fn new(
        schedule: &'a DiffusionSchedule,
        denoiser: &'a D,
        sampling: &SamplingConfig,
        tiling: &TilingConfig,
    ) -> Result<Self> {
        tiling.validate()?;

        // Tiles are blended from their final images only.
        let per_tile = SamplingConfig {
            keep_trajectory: false,
            show_progress: false,
            ..sampling.clone()
        };

        Ok(Self {
            sampler: ReverseSampler::new(schedule, denoiser, &per_tile)?,
            tiling: tiling.clone(),
            show_progress: sampling.show_progress,
        })
    }

    /// Sample the full-resolution image.
    ///
    /// Tiles run in parallel; the accumulation is done in tile order so the
    /// result does not depend on scheduling.
    ///
    /// # Errors
    ///
    /// Returns an error if any tile's chain fails.
    pub fn sample(&self, conditioning: &ConditioningBundle, seed: u64) -> Result<ImageTensor> {
        let (height, width) = conditioning.spatial();
        let tiles = plan_tiles(height, width, &self.tiling)?;

        tracing::info!(
            "Sampling {width}x{height} image as {} tile(s) of {}px (overlap {}px)",
            tiles.len(),
            self.tiling.tile_size,
            self.tiling.overlap
        );

        let pb = if self.show_progress {
            let pb = ProgressBar::new(tiles.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} Tiles [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                    .expect("valid template")
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let outputs = tiles
            .par_iter()
            .map(|tile| {
                let crop = conditioning.crop(tile.y, tile.x, tile.height, tile.width);
                let output = self.sampler.sample(&crop, tile_seed(seed, tile.y, tile.x))?;
                tracing::debug!("Tile {} at ({}, {}) complete", tile.index, tile.y, tile.x);
                pb.inc(1);
                Ok(output.image)
            })
            .collect::<Result<Vec<_>>>()?;

        pb.finish_with_message("Tiles complete");

        let channels = self.sampler.config().output_channels;
        let mut canvas = Canvas::new((conditioning.batch_size(), channels, height, width));
        for (tile, image) in tiles.iter().zip(&outputs) {
            canvas.accumulate(tile, image)?;
        }

        canvas.finish()
    }
}
