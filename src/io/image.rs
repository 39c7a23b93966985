//! 2D images for the image-segmentation pipelines.

use crate::error::{Error, Result};
use crate::volume::Volume;
use ndarray::{ArrayD, IxDyn};
use std::path::Path;

/// Load one channel of an 8-bit image as a `[height, width]` volume of raw
/// intensities (0-255).
pub fn load_channel<P: AsRef<Path>>(path: P, channel: usize) -> Result<Volume> {
    let path = path.as_ref();
    let decoded = image::open(path)?;
    let rgba = decoded.to_rgba8();
    let channels = decoded.color().channel_count() as usize;
    if channel >= channels {
        return Err(Error::InvalidDimensions(format!(
            "{}: channel {} requested but image has {} channel(s)",
            path.display(),
            channel,
            channels
        )));
    }
    // Grayscale images expand to RGBA with the value copied into every color channel.
    let rgba_index = if channels == 2 && channel == 1 { 3 } else { channel };
    let (width, height) = rgba.dimensions();
    let data = rgba
        .pixels()
        .map(|p| f32::from(p.0[rgba_index]))
        .collect::<Vec<_>>();
    ArrayD::from_shape_vec(IxDyn(&[height as usize, width as usize]), data)
        .map_err(|e| Error::InvalidDimensions(format!("{}: {}", path.display(), e)))
}
