//! Image saving utilities.

use std::path::Path;

use image::{ImageBuffer, Rgb};

use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Save the first image of a batch tensor as an image file.
///
/// The tensor is denormalized from [-1, 1] to [0, 255] and saved to the
/// specified path (format inferred from extension).
///
/// # Arguments
///
/// * `tensor` - NCHW tensor with values in [-1, 1] and three channels
/// * `path` - Output file path
/// * `quality` - JPEG quality (1-100), ignored for other formats
///
/// # Errors
///
/// Returns an error if the tensor is not an RGB batch or the image cannot be saved.
pub fn save_image<P: AsRef<Path>>(tensor: &ImageTensor, path: P, quality: u8) -> Result<()> {
    let path = path.as_ref();

    let (batch, channels, _, _) = tensor.dim();
    if batch == 0 || channels != RGB_CHANNELS {
        return Err(Error::shape("(>=1, 3, H, W)", tensor.shape()));
    }

    let img = image::DynamicImage::ImageRgb8(tensor_to_image(tensor));

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_lowercase();

    match extension.as_str() {
        "jpg" | "jpeg" => {
            let mut output = std::fs::File::create(path)?;
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
            img.write_with_encoder(encoder)
                .map_err(|source| Error::ImageSave {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        _ => {
            img.save(path).map_err(|source| Error::ImageSave {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    Ok(())
}

/// Convert the first image of a normalized NCHW tensor to an RGB image.
#[allow(clippy::cast_possible_truncation)]
fn tensor_to_image(tensor: &ImageTensor) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let (_, _, height, width) = tensor.dim();

    // Safe: dimensions come from images or tiles, which fit in u32
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    })
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = (value + 1.0) * 127.5;
    scaled.clamp(0.0, 255.0) as u8
}
