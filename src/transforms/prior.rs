//! Prior volumes: coordinate grids and binary folding.

use crate::error::{Error, Result};
use crate::volume::Volume;
use ndarray::{concatenate, ArrayD, Axis, IxDyn};

/// Coordinate grid of `shape`: a `[shape..., ndim]` volume whose channel `k`
/// holds each voxel's index along axis `k`.
pub fn location_grid(shape: &[usize]) -> Volume {
    let ndim = shape.len();
    let mut full = shape.to_vec();
    full.push(ndim);
    ArrayD::from_shape_fn(IxDyn(&full), |ix| ix[ix[ndim]] as f32)
}

/// Fold label channels `1..` of a `[..., C]` prior into channel 1, keeping
/// channel 0 (background) and dropping the rest.
pub fn force_binary(prior: &Volume) -> Result<Volume> {
    let channels = prior.shape().last().copied().unwrap_or(0);
    if prior.ndim() < 2 || channels < 2 {
        return Err(Error::InvalidDimensions(format!(
            "binary prior needs at least 2 channels in a trailing axis, got shape {:?}",
            prior.shape()
        )));
    }
    let last = Axis(prior.ndim() - 1);
    let background = prior.slice_axis(last, (0..1).into());
    let foreground = prior
        .slice_axis(last, (1..channels).into())
        .sum_axis(last)
        .insert_axis(last);
    concatenate(last, &[background, foreground.view()])
        .map_err(|e| Error::InvalidDimensions(format!("binary prior: {}", e)))
}

/// Take slice `index` of `axis`, keeping the axis with length 1.
pub fn extract_slice(volume: &Volume, axis: usize, index: usize) -> Result<Volume> {
    let len = volume.shape().get(axis).copied().ok_or_else(|| {
        Error::InvalidDimensions(format!(
            "axis {} out of range for shape {:?}",
            axis,
            volume.shape()
        ))
    })?;
    if index >= len {
        return Err(Error::InvalidDimensions(format!(
            "slice {} out of range for axis {} of length {}",
            index, axis, len
        )));
    }
    Ok(volume
        .slice_axis(Axis(axis), (index..index + 1).into())
        .to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    #[test]
    fn test_location_grid_channels_hold_indices() {
        let grid = location_grid(&[2, 3, 4]);
        assert_eq!(grid.shape(), &[2, 3, 4, 3]);
        assert_eq!(grid[[1, 2, 3, 0]], 1.0);
        assert_eq!(grid[[1, 2, 3, 1]], 2.0);
        assert_eq!(grid[[1, 2, 3, 2]], 3.0);
        assert_eq!(grid[[0, 0, 0, 2]], 0.0);
    }

    #[test]
    fn test_force_binary_folds_foreground() {
        let prior = ArrayD::from_shape_fn(IxDyn(&[2, 2, 4]), |ix| (ix[2] + 1) as f32);
        let binary = force_binary(&prior).unwrap();
        assert_eq!(binary.shape(), &[2, 2, 2]);
        assert_eq!(binary.slice(s![.., .., 0]).sum(), 4.0);
        assert_eq!(binary[[1, 1, 1]], 2.0 + 3.0 + 4.0);
    }

    #[test]
    fn test_force_binary_needs_channels() {
        let prior = ArrayD::<f32>::zeros(IxDyn(&[3, 1]));
        assert!(force_binary(&prior).is_err());
    }

    #[test]
    fn test_extract_slice() {
        let volume = ArrayD::from_shape_fn(IxDyn(&[2, 2, 3, 1]), |ix| ix[2] as f32);
        let slice = extract_slice(&volume, 2, 1).unwrap();
        assert_eq!(slice.shape(), &[2, 2, 1, 1]);
        assert!(slice.iter().all(|&v| v == 1.0));
        assert!(extract_slice(&volume, 2, 3).is_err());
    }
}
