//! Dense patch grids over n-dimensional volumes.
//!
//! Offsets are enumerated row-major with the last axis fastest. They are
//! never materialized: [`PatchGrid::offset`] unravels a linear index.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Patch shape and stride.
///
/// An empty `stride` means unit stride on every axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchSpec {
    /// Patch extent per axis.
    pub shape: Vec<usize>,
    /// Step between consecutive origins per axis.
    #[serde(default)]
    pub stride: Vec<usize>,
}

impl PatchSpec {
    /// Patch of `shape` with unit stride.
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            stride: Vec::new(),
        }
    }

    /// Non-overlapping tiling: stride equal to the patch shape.
    pub fn tiled(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        Self {
            stride: shape.clone(),
            shape,
        }
    }

    /// Set the stride.
    #[must_use]
    pub fn stride(mut self, stride: impl Into<Vec<usize>>) -> Self {
        self.stride = stride.into();
        self
    }

    /// Stride with the unit default filled in.
    pub fn resolved_stride(&self) -> Vec<usize> {
        if self.stride.is_empty() {
            vec![1; self.shape.len()]
        } else {
            self.stride.clone()
        }
    }

    /// Append a trailing axis covered by a single patch (the channel axis of a prior).
    #[must_use]
    pub fn with_trailing_axis(&self, len: usize) -> Self {
        let mut shape = self.shape.clone();
        let mut stride = self.resolved_stride();
        shape.push(len);
        stride.push(len);
        Self { shape, stride }
    }

    /// Check rank against a volume and reject zero entries.
    pub fn validate(&self, ndim: usize) -> Result<()> {
        let stride = self.resolved_stride();
        if self.shape.len() != ndim || stride.len() != ndim {
            return Err(Error::config(format!(
                "patch rank mismatch: shape {:?}, stride {:?}, volume rank {}",
                self.shape, self.stride, ndim
            )));
        }
        if self.shape.iter().chain(stride.iter()).any(|&v| v == 0) {
            return Err(Error::config(format!(
                "patch shape and stride entries must be positive: shape {:?}, stride {:?}",
                self.shape, stride
            )));
        }
        Ok(())
    }
}

/// Number of patch origins per axis.
///
/// An axis whose patch extent exceeds the volume contributes zero.
pub fn grid_size(volume_shape: &[usize], patch_shape: &[usize], stride: &[usize]) -> Vec<usize> {
    volume_shape
        .iter()
        .zip(patch_shape)
        .zip(stride)
        .map(|((&v, &p), &s)| if p <= v { (v - p) / s + 1 } else { 0 })
        .collect()
}

/// Regular grid of patch origins over one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchGrid {
    volume_shape: Vec<usize>,
    patch_shape: Vec<usize>,
    stride: Vec<usize>,
    counts: Vec<usize>,
    len: usize,
}

impl PatchGrid {
    /// Compute the grid. An empty `stride` means unit stride.
    pub fn compute(
        volume_shape: &[usize],
        patch_shape: &[usize],
        stride: &[usize],
    ) -> Result<Self> {
        let spec = PatchSpec {
            shape: patch_shape.to_vec(),
            stride: stride.to_vec(),
        };
        Self::for_spec(volume_shape, &spec)
    }

    /// Compute the grid for a [`PatchSpec`].
    pub fn for_spec(volume_shape: &[usize], spec: &PatchSpec) -> Result<Self> {
        spec.validate(volume_shape.len())?;
        let stride = spec.resolved_stride();
        let counts = grid_size(volume_shape, &spec.shape, &stride);
        let len = counts.iter().product();
        Ok(Self {
            volume_shape: volume_shape.to_vec(),
            patch_shape: spec.shape.clone(),
            stride,
            counts,
            len,
        })
    }

    /// Total number of patches.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the grid holds no patch.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Patches per axis.
    pub fn axis_counts(&self) -> &[usize] {
        &self.counts
    }

    /// Patch extent per axis.
    pub fn patch_shape(&self) -> &[usize] {
        &self.patch_shape
    }

    /// Stride per axis.
    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    /// Fail with [`Error::EmptyPatchGrid`] naming `source` when the grid is empty.
    pub fn ensure_non_empty(&self, source: &str) -> Result<()> {
        if self.is_empty() {
            return Err(Error::EmptyPatchGrid {
                source_name: source.to_string(),
                volume_shape: self.volume_shape.clone(),
                patch_shape: self.patch_shape.clone(),
            });
        }
        Ok(())
    }

    /// Origin of patch `index`, last axis fastest.
    pub fn offset(&self, index: usize) -> Option<Vec<usize>> {
        if index >= self.len {
            return None;
        }
        let mut offset = vec![0; self.counts.len()];
        let mut rem = index;
        for axis in (0..self.counts.len()).rev() {
            let count = self.counts[axis];
            offset[axis] = (rem % count) * self.stride[axis];
            rem /= count;
        }
        Some(offset)
    }

    /// Iterate over all origins in order.
    pub fn iter(&self) -> Offsets<'_> {
        Offsets {
            grid: self,
            next: 0,
        }
    }
}

/// Iterator over the origins of a [`PatchGrid`].
#[derive(Debug, Clone)]
pub struct Offsets<'a> {
    grid: &'a PatchGrid,
    next: usize,
}

impl Iterator for Offsets<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.grid.offset(self.next)?;
        self.next += 1;
        Some(offset)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.len - self.next.min(self.grid.len);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Offsets<'_> {}

impl<'a> IntoIterator for &'a PatchGrid {
    type Item = Vec<usize>;
    type IntoIter = Offsets<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_count_formula_and_bounds() {
        let cases: &[(&[usize], &[usize], &[usize])] = &[
            (&[8, 8, 8], &[4, 4, 4], &[4, 4, 4]),
            (&[10, 7, 5], &[3, 2, 5], &[2, 3, 1]),
            (&[9, 9], &[4, 4], &[]),
            (&[5], &[5], &[2]),
            (&[6, 11, 4, 3], &[2, 5, 4, 1], &[3, 2, 1, 2]),
        ];
        for &(volume, patch, stride) in cases {
            let grid = PatchGrid::compute(volume, patch, stride).unwrap();
            let stride = if stride.is_empty() { vec![1; volume.len()] } else { stride.to_vec() };
            let expected: usize = (0..volume.len())
                .map(|i| (volume[i] - patch[i]) / stride[i] + 1)
                .product();
            assert_eq!(grid.len(), expected, "volume {:?}", volume);

            let offsets: Vec<Vec<usize>> = grid.iter().collect();
            assert_eq!(offsets.len(), expected);
            for o in &offsets {
                for i in 0..volume.len() {
                    assert!(o[i] + patch[i] <= volume[i]);
                }
            }
            let distinct: HashSet<&Vec<usize>> = offsets.iter().collect();
            assert_eq!(distinct.len(), expected);
        }
    }

    #[test]
    fn test_last_axis_fastest() {
        let grid = PatchGrid::compute(&[4, 6], &[2, 2], &[2, 2]).unwrap();
        let offsets: Vec<Vec<usize>> = grid.iter().collect();
        assert_eq!(
            offsets,
            vec![
                vec![0, 0],
                vec![0, 2],
                vec![0, 4],
                vec![2, 0],
                vec![2, 2],
                vec![2, 4]
            ]
        );
        assert_eq!(grid.axis_counts(), &[2, 3]);
    }

    #[test]
    fn test_whole_volume_single_offset() {
        let grid = PatchGrid::compute(&[3, 4, 5], &[3, 4, 5], &[]).unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.offset(0), Some(vec![0, 0, 0]));
        assert_eq!(grid.offset(1), None);
    }

    #[test]
    fn test_oversized_patch_is_empty() {
        let grid = PatchGrid::compute(&[8, 3, 8], &[4, 4, 4], &[4, 4, 4]).unwrap();
        assert!(grid.is_empty());
        assert_eq!(grid.iter().count(), 0);
        match grid.ensure_non_empty("subj01.npz") {
            Err(Error::EmptyPatchGrid { source_name, .. }) => assert_eq!(source_name, "subj01.npz"),
            other => panic!("expected empty grid error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_specs() {
        assert!(matches!(
            PatchGrid::compute(&[8, 8], &[4, 4, 4], &[]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            PatchGrid::compute(&[8, 8], &[4, 4], &[1]),
            Err(Error::Configuration(_))
        ));
        assert!(PatchGrid::compute(&[8, 8], &[0, 4], &[]).is_err());
        assert!(PatchGrid::compute(&[8, 8], &[4, 4], &[0, 1]).is_err());
    }

    #[test]
    fn test_trailing_axis_spec() {
        let spec = PatchSpec::new(vec![4, 4]).with_trailing_axis(3);
        assert_eq!(spec.shape, vec![4, 4, 3]);
        assert_eq!(spec.stride, vec![1, 1, 3]);
        let grid = PatchGrid::for_spec(&[4, 5, 3], &spec).unwrap();
        assert_eq!(grid.axis_counts(), &[1, 2, 1]);
    }

    #[test]
    fn test_spec_json_defaults_stride() {
        let spec: PatchSpec = serde_json::from_str(r#"{"shape": [4, 4]}"#).unwrap();
        assert_eq!(spec, PatchSpec::new(vec![4, 4]));
        assert!(serde_json::from_str::<PatchSpec>(r#"{"shape": [4], "step": [1]}"#).is_err());
    }
}
