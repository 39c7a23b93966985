//! Label remapping and per-patch label encodings.

use crate::error::{Error, Result};
use crate::volume::Volume;
use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sparse-to-dense label remapping (`{old_value: new_value}`).
///
/// Voxels whose value is not a key are left untouched. Keys are matched
/// against the integer value of each voxel; fractional voxels never match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelabelMap(BTreeMap<i64, i64>);

impl RelabelMap {
    /// Empty map (identity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `values[i]` to `i`, the dense relabelling used for segmentation
    /// volumes whose label values are not contiguous.
    pub fn from_values(values: &[i64]) -> Self {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i as i64))
            .collect()
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, from: i64, to: i64) -> Option<i64> {
        self.0.insert(from, to)
    }

    /// Target value for `from`, if mapped.
    pub fn get(&self, from: i64) -> Option<i64> {
        self.0.get(&from).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remap `volume` in place.
    ///
    /// Lookups use the original voxel value, so chained entries such as
    /// `{1: 2, 2: 3}` do not cascade.
    pub fn apply(&self, volume: &mut Volume) {
        if self.0.is_empty() {
            return;
        }
        volume.mapv_inplace(|v| {
            if v.fract() != 0.0 || !v.is_finite() {
                return v;
            }
            match self.0.get(&(v as i64)) {
                Some(&to) => to as f32,
                None => v,
            }
        });
    }
}

impl FromIterator<(i64, i64)> for RelabelMap {
    fn from_iter<I: IntoIterator<Item = (i64, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Return a relabelled copy of `volume`.
#[must_use = "this function returns a new volume and does not modify the original"]
pub fn relabel(volume: &Volume, map: &RelabelMap) -> Volume {
    let mut out = volume.clone();
    map.apply(&mut out);
    out
}

/// One-hot expand `array` into a trailing axis of length `nb_classes`.
///
/// Every value must be an integer in `[0, nb_classes)`.
pub fn to_categorical(array: &ArrayD<f32>, nb_classes: usize) -> Result<ArrayD<f32>> {
    categorical(array, nb_classes, "categorical expansion")
}

fn categorical(array: &ArrayD<f32>, nb_classes: usize, source: &str) -> Result<ArrayD<f32>> {
    if nb_classes == 0 {
        return Err(Error::config("nb_classes must be at least 1"));
    }
    let mut data = vec![0.0f32; array.len() * nb_classes];
    for (i, &v) in array.iter().enumerate() {
        if v.fract() != 0.0 || v < 0.0 || v >= nb_classes as f32 {
            return Err(Error::integrity(
                source,
                format!("label {} is outside [0, {})", v, nb_classes),
            ));
        }
        data[i * nb_classes + v as usize] = 1.0;
    }
    let mut shape = array.shape().to_vec();
    shape.push(nb_classes);
    ArrayD::from_shape_vec(IxDyn(&shape), data)
        .map_err(|e| Error::InvalidDimensions(format!("categorical reshape: {}", e)))
}

/// Append a trailing channel axis of length 1.
#[must_use = "this function returns a new array and does not modify the original"]
pub fn add_channel(array: ArrayD<f32>) -> ArrayD<f32> {
    let axis = Axis(array.ndim());
    array.insert_axis(axis)
}

/// Remove `axis`, which must have length 1.
pub fn collapse_axis(array: ArrayD<f32>, axis: usize, source: &str) -> Result<ArrayD<f32>> {
    match array.shape().get(axis) {
        Some(1) => Ok(array.index_axis_move(Axis(axis), 0)),
        Some(&len) => Err(Error::integrity(
            source,
            format!("cannot collapse axis {} of length {}", axis, len),
        )),
        None => Err(Error::integrity(
            source,
            format!(
                "cannot collapse axis {} of a {}-dimensional patch",
                axis,
                array.ndim()
            ),
        )),
    }
}

/// How each extracted patch is encoded before batching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LabelEncoding {
    /// Patch unchanged.
    #[default]
    None,
    /// Trailing channel axis of length 1.
    Channel,
    /// One-hot labels in a trailing axis.
    Categorical {
        /// Number of label classes.
        nb_labels: usize,
        /// Keep the spatial shape; otherwise flatten to `[voxels, nb_labels]`.
        #[serde(default = "default_keep_shape")]
        keep_shape: bool,
    },
}

fn default_keep_shape() -> bool {
    true
}

impl LabelEncoding {
    /// Encode one patch; `source` names the volume in errors.
    pub fn apply(&self, patch: ArrayD<f32>, source: &str) -> Result<ArrayD<f32>> {
        match *self {
            Self::None => Ok(patch),
            Self::Channel => Ok(add_channel(patch)),
            Self::Categorical {
                nb_labels,
                keep_shape,
            } => {
                let encoded = categorical(&patch, nb_labels, source)?;
                if keep_shape {
                    Ok(encoded)
                } else {
                    let voxels = patch.len();
                    encoded
                        .into_shape_with_order(IxDyn(&[voxels, nb_labels]))
                        .map_err(|e| Error::InvalidDimensions(format!("{}: {}", source, e)))
                }
            }
        }
    }

    /// Number of trailing label channels produced, if any.
    pub fn nb_labels(&self) -> Option<usize> {
        match *self {
            Self::Categorical { nb_labels, .. } => Some(nb_labels),
            Self::Channel => Some(1),
            Self::None => None,
        }
    }
}
