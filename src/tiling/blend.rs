//! Weighted accumulation of tile outputs.

use ndarray::{s, Array2, Axis, Zip};

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::Tile;

/// Blend weight along one axis at local position `i` of a tile of length `len`.
///
/// Sides that touch the image border weigh 1; sides shared with a neighbour
/// ramp linearly from near 0 at the tile edge to 1 at `overlap` pixels inside.
#[allow(clippy::cast_precision_loss)]
fn axis_weight(i: usize, len: usize, overlap: usize, ramp_start: bool, ramp_end: bool) -> f32 {
    let ramp = |d: usize| {
        if overlap == 0 {
            1.0
        } else {
            ((d as f32 + 0.5) / overlap as f32).min(1.0)
        }
    };

    let start = if ramp_start { ramp(i) } else { 1.0 };
    let end = if ramp_end { ramp(len - 1 - i) } else { 1.0 };
    start.min(end)
}

/// Per-pixel blend weights of a tile, shaped `(height, width)`.
#[must_use]
pub fn tile_weights(tile: &Tile) -> Array2<f32> {
    let wy: Vec<f32> = (0..tile.height)
        .map(|i| axis_weight(i, tile.height, tile.overlap, tile.y > 0, !tile.touches_bottom))
        .collect();
    let wx: Vec<f32> = (0..tile.width)
        .map(|i| axis_weight(i, tile.width, tile.overlap, tile.x > 0, !tile.touches_right))
        .collect();

    Array2::from_shape_fn((tile.height, tile.width), |(y, x)| wy[y] * wx[x])
}

/// Output canvas accumulating weighted tile results.
#[derive(Debug)]
pub struct Canvas {
    sum: ImageTensor,
    weight: Array2<f32>,
}

impl Canvas {
    /// Empty canvas of shape `(n, c, h, w)`.
    #[must_use]
    pub fn new(shape: (usize, usize, usize, usize)) -> Self {
        Self {
            sum: ImageTensor::zeros(shape),
            weight: Array2::zeros((shape.2, shape.3)),
        }
    }

    /// Add a tile result to its region. Overlapping pixels accumulate, they are
    /// never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `data` does not match the tile.
    pub fn accumulate(&mut self, tile: &Tile, data: &ImageTensor) -> Result<()> {
        let (n, c, _, _) = self.sum.dim();
        if data.dim() != (n, c, tile.height, tile.width) {
            return Err(Error::shape(
                format!("tile output {:?}", (n, c, tile.height, tile.width)),
                data.shape(),
            ));
        }

        let weights = tile_weights(tile);
        let rows = tile.y..tile.y + tile.height;
        let cols = tile.x..tile.x + tile.width;

        let mut region = self.sum.slice_mut(s![.., .., rows.clone(), cols.clone()]);
        for (mut dst, src) in region.outer_iter_mut().zip(data.outer_iter()) {
            for (mut dst, src) in dst.outer_iter_mut().zip(src.outer_iter()) {
                Zip::from(&mut dst)
                    .and(&src)
                    .and(&weights)
                    .for_each(|acc, &v, &w| *acc += v * w);
            }
        }

        self.weight
            .slice_mut(s![rows, cols])
            .zip_mut_with(&weights, |acc, &w| *acc += w);

        Ok(())
    }

    /// Normalize by the accumulated weight of each pixel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if some pixel was never covered.
    pub fn finish(mut self) -> Result<ImageTensor> {
        if let Some(((y, x), _)) = self.weight.indexed_iter().find(|(_, w)| **w <= 0.0) {
            return Err(Error::ShapeMismatch {
                expected: "full tile coverage".to_string(),
                actual: format!("uncovered pixel at ({y}, {x})"),
            });
        }

        for mut image in self.sum.axis_iter_mut(Axis(0)) {
            for mut channel in image.axis_iter_mut(Axis(0)) {
                Zip::from(&mut channel)
                    .and(&self.weight)
                    .for_each(|v, &w| *v /= w);
            }
        }

        Ok(self.sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::{plan_tiles, TilingConfig};

    #[test]
    fn test_border_sides_have_full_weight() {
        let tiles = plan_tiles(10, 10, &TilingConfig { tile_size: 10, overlap: 4 }).unwrap();
        assert_eq!(tiles.len(), 1);
        assert!(tile_weights(&tiles[0]).iter().all(|&w| w == 1.0));
    }

    #[test]
    fn test_interior_sides_ramp() {
        let tiles = plan_tiles(8, 12, &TilingConfig { tile_size: 8, overlap: 4 }).unwrap();
        assert_eq!(tiles.len(), 2);

        let left = tile_weights(&tiles[0]);
        // Left tile: left border full, right side ramps down.
        assert_eq!(left[[3, 0]], 1.0);
        assert_eq!(left[[3, 3]], 1.0);
        assert!(left[[3, 7]] < left[[3, 6]]);
        assert!(left[[3, 7]] > 0.0);
        assert_eq!(left[[0, 7]], left[[7, 7]]);

        let right = tile_weights(&tiles[1]);
        assert!(right[[3, 0]] < right[[3, 1]]);
        assert_eq!(right[[3, 7]], 1.0);
    }

    #[test]
    fn test_constant_tiles_blend_to_constant() {
        let config = TilingConfig { tile_size: 6, overlap: 3 };
        let tiles = plan_tiles(11, 13, &config).unwrap();
        let mut canvas = Canvas::new((2, 3, 11, 13));

        for tile in &tiles {
            canvas
                .accumulate(tile, &ImageTensor::from_elem((2, 3, tile.height, tile.width), 0.7))
                .unwrap();
        }

        let out = canvas.finish().unwrap();
        assert!(out.iter().all(|v| (v - 0.7).abs() < 1e-6));
    }

    #[test]
    fn test_uncovered_canvas_rejected() {
        let canvas = Canvas::new((1, 1, 2, 2));
        assert!(canvas.finish().is_err());
    }

    #[test]
    fn test_accumulate_rejects_wrong_shape() {
        let tiles = plan_tiles(4, 4, &TilingConfig { tile_size: 4, overlap: 0 }).unwrap();
        let mut canvas = Canvas::new((1, 3, 4, 4));
        assert!(canvas.accumulate(&tiles[0], &ImageTensor::zeros((1, 3, 2, 2))).is_err());
    }
}
