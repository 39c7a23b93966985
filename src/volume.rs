//! In-memory volume and batch representations.
//!
//! Every loader converts its on-disk element type to `f32` and returns a
//! [`Volume`] in standard (row-major) layout. A [`Batch`] is the same array type
//! with a leading batch axis.

use crate::error::{Error, Result};
use ndarray::{concatenate, stack, ArrayD, ArrayViewD, Axis, Dimension};

/// n-dimensional image data (spatial axes plus an optional trailing channel axis).
pub type Volume = ArrayD<f32>;

/// Samples stacked along a new leading axis.
pub type Batch = ArrayD<f32>;

/// Number of samples actually present in a batch.
#[inline]
pub fn realized_size(batch: &Batch) -> usize {
    batch.shape().first().copied().unwrap_or(0)
}

/// Stack equally shaped samples along a new leading axis.
pub fn stack_samples(samples: &[ArrayD<f32>]) -> Result<Batch> {
    if samples.is_empty() {
        return Err(Error::InvalidDimensions(
            "cannot stack an empty list of samples".to_string(),
        ));
    }
    let views: Vec<ArrayViewD<'_, f32>> = samples.iter().map(|s| s.view()).collect();
    stack(Axis(0), &views).map_err(|e| {
        Error::InvalidDimensions(format!(
            "samples do not share a shape (first {:?}): {}",
            samples[0].shape(),
            e
        ))
    })
}

/// Concatenate samples along their last axis (feature grouping).
pub fn concat_last_axis(samples: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
    let first = samples.first().ok_or_else(|| {
        Error::InvalidDimensions("cannot concatenate an empty feature group".to_string())
    })?;
    if samples.len() == 1 {
        return Ok(first.clone());
    }
    if first.ndim() == 0 {
        return Err(Error::InvalidDimensions(
            "cannot concatenate zero-dimensional samples".to_string(),
        ));
    }
    let axis = Axis(first.ndim() - 1);
    let views: Vec<ArrayViewD<'_, f32>> = samples.iter().map(|s| s.view()).collect();
    concatenate(axis, &views).map_err(|e| {
        Error::InvalidDimensions(format!(
            "feature samples cannot be concatenated along axis {}: {}",
            axis.index(),
            e
        ))
    })
}

/// Reject NaN and infinite samples, naming `source` in the error.
pub fn ensure_finite(data: &ArrayD<f32>, source: &str) -> Result<()> {
    if let Some((idx, value)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
        let kind = if value.is_nan() { "NaN" } else { "infinite value" };
        return Err(Error::integrity(
            source,
            format!("found a {} at index {:?}", kind, idx.slice()),
        ));
    }
    Ok(())
}
