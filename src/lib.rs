//! # medfeed
//!
//! Lazy data-feeding pipelines for volumetric (3D medical) and 2D
//! segmentation and regression training.
//!
//! A [`VolumeStream`] cycles over the volumes of a directory, splits each one
//! into a grid of patches and yields fixed-size batches indefinitely.
//! [`PairedStream`] keeps an input and a target directory in lock-step, and
//! [`PriorCoupler`] attaches a spatial prior whose batch size is negotiated
//! per pair so it always matches the paired batch.
//!
//! ```ignore
//! use medfeed::{PairedStream, PairedStreamConfig, PatchSpec, VolumeStreamConfig};
//!
//! let base = VolumeStreamConfig {
//!     batch_size: 8,
//!     patch: Some(PatchSpec::tiled(vec![32, 32, 32])),
//!     seed: Some(0),
//!     ..Default::default()
//! };
//! let pairs = PairedStream::open("vols", "segs", PairedStreamConfig::shared(base))?;
//! for pair in pairs.take(100) {
//!     let (input, target) = pair?;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod io;
pub mod pipeline;
pub mod transforms;
pub mod volume;

#[cfg(feature = "python")]
pub mod python;

pub use error::{Error, Result};
pub use io::{FileLoader, VolumeFormat, VolumeLoader};
pub use pipeline::extra::{
    CategoryStream, ExtDataConfig, ExtDataStream, ImageSegConfig, ImageSegStream,
    LabelCountStream, SegAutoencoderStream, SliceSampling, SliceSuperResConfig,
    SliceSuperResStream, VolExtDataConfig, VolExtDataStream,
};
pub use pipeline::{
    FileCycle, MismatchPolicy, PairSource, PairedStream, PairedStreamConfig, PatchGrid,
    PatchSpec, PatchStream, PatchStreamConfig, PriorConfig, PriorCoupler, PriorFeed,
    PriorSource, TrainingPair, VolumeStream, VolumeStreamConfig,
};
pub use transforms::{LabelEncoding, RelabelMap};
pub use volume::{Batch, Volume};
