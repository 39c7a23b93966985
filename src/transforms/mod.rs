//! Volume and patch transforms applied between loading and batching.

pub mod labels;
pub mod prior;

pub use labels::{add_channel, collapse_axis, relabel, to_categorical, LabelEncoding, RelabelMap};
pub use prior::{extract_slice, force_binary, location_grid};
