//! Image loading utilities.

use std::path::Path;

use image::DynamicImage;
use ndarray::Array4;

use crate::error::{Error, Result};

use super::{ImageTensor, MASK_CHANNELS, RGB_CHANNELS};

/// Load an exposure from disk as a normalized tensor.
///
/// The image is:
/// 1. Loaded from the specified path at its native resolution
/// 2. Converted to RGB if necessary
/// 3. Normalized to [-1, 1] range
/// 4. Returned as NCHW tensor (1, 3, H, W)
///
/// # Errors
///
/// Returns an error if the image cannot be loaded.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<ImageTensor> {
    Ok(rgb_to_tensor(&open(path.as_ref())?))
}

/// Load a single-channel mask as a tensor (1, 1, H, W) with values in [0, 1].
///
/// # Errors
///
/// Returns an error if the image cannot be loaded.
pub fn load_mask<P: AsRef<Path>>(path: P) -> Result<ImageTensor> {
    Ok(luma_to_tensor(&open(path.as_ref())?))
}

fn open(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })
}

/// Convert a `DynamicImage` to a normalized NCHW tensor.
fn rgb_to_tensor(img: &DynamicImage) -> ImageTensor {
    let rgb = img.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);

    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, height, width));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            // Normalize from [0, 255] to [-1, 1]
            tensor[[0, c, y, x]] = (f32::from(pixel[c]) / 127.5) - 1.0;
        }
    }

    tensor
}

fn luma_to_tensor(img: &DynamicImage) -> ImageTensor {
    let gray = img.to_luma8();
    let (width, height) = (gray.width() as usize, gray.height() as usize);

    let mut tensor = Array4::<f32>::zeros((1, MASK_CHANNELS, height, width));

    for (x, y, pixel) in gray.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = f32::from(pixel[0]) / 255.0;
    }

    tensor
}
