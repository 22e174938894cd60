//! Side inputs that steer the denoiser: ambient and flash exposures plus an
//! optional highlight/window mask.

use std::path::Path;

use ndarray::{concatenate, s, Axis};

use crate::error::{Error, Result};
use crate::image::{self, ImageTensor};

/// Spatially aligned conditioning inputs for a batch.
///
/// All members share batch size, height and width. The bundle is read-only once
/// built.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningBundle {
    ambient: ImageTensor,
    flash: ImageTensor,
    mask: Option<ImageTensor>,
}

impl ConditioningBundle {
    /// Create a bundle, checking that all members are aligned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if batch size or spatial size differ.
    pub fn new(ambient: ImageTensor, flash: ImageTensor, mask: Option<ImageTensor>) -> Result<Self> {
        let (n, _, h, w) = ambient.dim();
        let aligned = |t: &ImageTensor| {
            let (tn, _, th, tw) = t.dim();
            (tn, th, tw) == (n, h, w)
        };

        if !aligned(&flash) {
            return Err(Error::shape(
                format!("flash aligned with ambient {:?}", ambient.shape()),
                flash.shape(),
            ));
        }
        if let Some(mask) = &mask {
            if !aligned(mask) {
                return Err(Error::shape(
                    format!("mask aligned with ambient {:?}", ambient.shape()),
                    mask.shape(),
                ));
            }
        }

        Ok(Self {
            ambient,
            flash,
            mask,
        })
    }

    /// Load a bundle from image files.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or the images are not aligned.
    pub fn load<P: AsRef<Path>>(ambient: P, flash: P, mask: Option<P>) -> Result<Self> {
        let ambient = image::load_image(ambient)?;
        let flash = image::load_image(flash)?;
        let mask = mask.map(image::load_mask).transpose()?;
        Self::new(ambient, flash, mask)
    }

    /// Ambient exposure.
    #[must_use]
    pub fn ambient(&self) -> &ImageTensor {
        &self.ambient
    }

    /// Flash exposure.
    #[must_use]
    pub fn flash(&self) -> &ImageTensor {
        &self.flash
    }

    /// Optional highlight/window mask.
    #[must_use]
    pub fn mask(&self) -> Option<&ImageTensor> {
        self.mask.as_ref()
    }

    /// Number of examples in the batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.ambient.dim().0
    }

    /// Spatial size as `(height, width)`.
    #[must_use]
    pub fn spatial(&self) -> (usize, usize) {
        let (_, _, h, w) = self.ambient.dim();
        (h, w)
    }

    /// Total number of conditioning channels.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.ambient.dim().1 + self.flash.dim().1 + self.mask.as_ref().map_or(0, |m| m.dim().1)
    }

    /// All members stacked along the channel axis: ambient, flash, mask.
    ///
    /// # Errors
    ///
    /// Returns an error if the members cannot be concatenated.
    pub fn stacked(&self) -> Result<ImageTensor> {
        let mut views = vec![self.ambient.view(), self.flash.view()];
        if let Some(mask) = &self.mask {
            views.push(mask.view());
        }

        concatenate(Axis(1), &views).map_err(|e| Error::ShapeMismatch {
            expected: "aligned conditioning members".to_string(),
            actual: e.to_string(),
        })
    }

    /// Crop every member to the window starting at `(y, x)` of size `(h, w)`.
    ///
    /// # Panics
    ///
    /// Panics if the window exceeds the bundle.
    #[must_use]
    pub fn crop(&self, y: usize, x: usize, h: usize, w: usize) -> Self {
        let cut = |t: &ImageTensor| t.slice(s![.., .., y..y + h, x..x + w]).to_owned();

        Self {
            ambient: cut(&self.ambient),
            flash: cut(&self.flash),
            mask: self.mask.as_ref().map(cut),
        }
    }

    /// Check that a target or sample tensor is aligned with the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] on batch or spatial mismatch.
    pub fn check_aligned(&self, tensor: &ImageTensor) -> Result<()> {
        let (n, _, h, w) = tensor.dim();
        if (n, (h, w)) == (self.batch_size(), self.spatial()) {
            Ok(())
        } else {
            Err(Error::shape(
                format!("batch {} at {:?}", self.batch_size(), self.spatial()),
                tensor.shape(),
            ))
        }
    }
}
