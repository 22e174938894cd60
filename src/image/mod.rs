//! Image loading, processing, and saving utilities.

mod load;
mod save;

pub use load::{load_image, load_mask};
pub use save::save_image;

use ndarray::Array4;

/// Image tensor in NCHW format (batch, channels, height, width).
/// Color values are normalized to [-1, 1]; masks use [0, 1].
pub type ImageTensor = Array4<f32>;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;

/// Number of channels in a mask layer.
pub const MASK_CHANNELS: usize = 1;
