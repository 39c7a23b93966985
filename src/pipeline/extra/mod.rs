//! Additional stream families built on the core pipelines.

pub mod category;
pub mod ext_data;
pub mod image_seg;
pub mod slices;

pub use category::CategoryStream;
pub use ext_data::{ExtDataConfig, ExtDataStream, VolExtDataConfig, VolExtDataStream};
pub use image_seg::{ImageSegConfig, ImageSegStream};
pub use slices::{SliceSampling, SliceSuperResConfig, SliceSuperResStream};

use super::volume::{VolumeStream, VolumeStreamConfig};
use super::TrainingPair;
use crate::error::{Error, Result};
use crate::transforms::LabelEncoding;
use crate::volume::Batch;
use ndarray::{Axis, IxDyn};
use std::path::Path;

/// Segmentation autoencoding: the categorical segmentation batch is both the
/// input and, flattened to `[B, voxels, nb_labels]`, the output.
#[derive(Debug)]
pub struct SegAutoencoderStream {
    segs: VolumeStream,
    failed: bool,
}

impl SegAutoencoderStream {
    /// Open over a directory of segmentations. The encoding must be
    /// categorical; its spatial shape is always kept.
    pub fn open<P: AsRef<Path>>(directory: P, config: VolumeStreamConfig) -> Result<Self> {
        let nb_labels = match config.encoding {
            LabelEncoding::Categorical { nb_labels, .. } => nb_labels,
            other => {
                return Err(Error::config(format!(
                    "segmentation autoencoder needs a categorical encoding, got {:?}",
                    other
                )))
            }
        };
        let config = VolumeStreamConfig {
            encoding: LabelEncoding::Categorical {
                nb_labels,
                keep_shape: true,
            },
            ..config
        };
        Self::from_stream(VolumeStream::open(directory, config)?)
    }

    /// Wrap an opened stream with a shape-keeping categorical encoding.
    pub fn from_stream(segs: VolumeStream) -> Result<Self> {
        match segs.config().encoding {
            LabelEncoding::Categorical {
                keep_shape: true, ..
            } => Ok(Self {
                segs,
                failed: false,
            }),
            other => Err(Error::config(format!(
                "segmentation autoencoder needs a shape-keeping categorical encoding, got {:?}",
                other
            ))),
        }
    }

    fn next_pair(&mut self) -> Result<TrainingPair> {
        let input = self
            .segs
            .next()
            .unwrap_or_else(|| Err(Error::Exhausted("segmentation stream".into())))?;
        let output = flatten_spatial(&input)?;
        Ok(TrainingPair::new(input, output))
    }
}

impl Iterator for SegAutoencoderStream {
    type Item = Result<TrainingPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_pair();
        self.failed = result.is_err();
        Some(result)
    }
}

/// Reshape `[B, spatial..., L]` to `[B, voxels, L]`.
fn flatten_spatial(batch: &Batch) -> Result<Batch> {
    let shape = batch.shape();
    if shape.len() < 2 {
        return Err(Error::InvalidDimensions(format!(
            "expected [batch, ..., labels], got {:?}",
            shape
        )));
    }
    let b = shape[0];
    let labels = shape[shape.len() - 1];
    let voxels = shape[1..shape.len() - 1].iter().product::<usize>();
    batch
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(IxDyn(&[b, voxels, labels]))
        .map_err(|e| Error::InvalidDimensions(format!("flatten {:?}: {}", shape, e)))
}

/// Replaces the first output of each pair by its per-label voxel counts
/// `[B, nb_labels]`.
#[derive(Debug)]
pub struct LabelCountStream<S> {
    source: S,
}

impl<S> LabelCountStream<S>
where
    S: Iterator<Item = Result<TrainingPair>>,
{
    /// Wrap a pair source whose first output is `[B, ..., nb_labels]`.
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Unwrap the inner source.
    pub fn into_inner(self) -> S {
        self.source
    }
}

impl<S> Iterator for LabelCountStream<S>
where
    S: Iterator<Item = Result<TrainingPair>>,
{
    type Item = Result<TrainingPair>;

    fn next(&mut self) -> Option<Self::Item> {
        let pair = self.source.next()?;
        Some(pair.and_then(|mut pair| {
            let first = pair
                .outputs
                .first()
                .ok_or_else(|| Error::InvalidDimensions("pair has no output".into()))?;
            let counts = flatten_spatial(first)?.sum_axis(Axis(1));
            pair.outputs[0] = counts;
            Ok(pair)
        }))
    }
}
