//! Attaching a spatial prior to a pair stream.
//!
//! The prior is patched with the same grid as the input volumes and batched
//! through a negotiated [`PatchStream`], so each prior batch has exactly the
//! realized size of the pair it accompanies, including the short final batch
//! of a cycle.

use super::grid::PatchSpec;
use super::paired::PairedStream;
use super::patch::{PatchStream, PatchStreamConfig};
use super::{PairSource, TrainingPair};
use crate::error::{Error, Result};
use crate::io::{FileLoader, VolumeFormat, VolumeLoader};
use crate::transforms::{extract_slice, force_binary, location_grid};
use crate::volume::{ensure_finite, realized_size, Volume};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

/// Where the prior comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorSource {
    /// Coordinate grid; `shape` defaults to the paired input volume shape.
    Location {
        /// Spatial shape of the grid.
        #[serde(default)]
        shape: Option<Vec<usize>>,
    },
    /// Precomputed prior read once from disk.
    File {
        /// `.npz`, `.npy`, NIfTI or MGZ file.
        path: PathBuf,
        /// Array key for `.npz` files.
        #[serde(default = "default_prior_key")]
        key: String,
    },
    /// Prior already in memory.
    #[serde(skip)]
    Volume(Volume),
}

fn default_prior_key() -> String {
    "prior".to_string()
}

impl Default for PriorSource {
    fn default() -> Self {
        Self::Location { shape: None }
    }
}

/// Which side of the training pair receives the prior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorFeed {
    /// Append to the model inputs.
    #[default]
    Input,
    /// Append to the model outputs.
    Output,
}

/// Options for a [`PriorCoupler`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorConfig {
    /// Prior origin.
    pub source: PriorSource,
    /// Side receiving the prior.
    pub feed: PriorFeed,
    /// Spatial patch; defaults to the paired input patch, else the whole prior.
    pub patch: Option<PatchSpec>,
    /// Fold label channels `1..` into one foreground channel.
    pub force_binary: bool,
    /// Patch axis to squeeze.
    pub collapse_axis: Option<usize>,
    /// Keep only this slice of the last spatial axis.
    pub extract_slice: Option<usize>,
    /// Log the prior load at info level.
    pub verbose: bool,
}

impl PriorConfig {
    /// Parse from JSON, rejecting unknown keys.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Pair stream with a prior batch attached to every pair.
///
/// Works over any [`PairSource`]; the default is a [`PairedStream`].
#[derive(Debug)]
pub struct PriorCoupler<S = PairedStream> {
    source: S,
    prior: PatchStream,
    feed: PriorFeed,
    failed: bool,
}

impl<S: PairSource> PriorCoupler<S> {
    /// Build the prior and its negotiated patch stream.
    pub fn open(source: S, config: PriorConfig) -> Result<Self> {
        let input = source.input_stream();
        let started = Instant::now();
        let mut prior = match config.source {
            PriorSource::Location { shape } => {
                let shape = shape.unwrap_or_else(|| input.volume_shape().to_vec());
                location_grid(&shape)
            }
            PriorSource::File { path, key } => FileLoader::new(VolumeFormat::from_path(&path)?)
                .npz_key(key)
                .load(&path)?,
            PriorSource::Volume(volume) => volume,
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if config.verbose {
            info!(shape = ?prior.shape(), elapsed_ms, "loaded prior");
        } else {
            debug!(shape = ?prior.shape(), elapsed_ms, "loaded prior");
        }

        if config.force_binary {
            prior = force_binary(&prior)?;
        }
        if prior.ndim() < 2 {
            return Err(Error::InvalidDimensions(format!(
                "prior must be [spatial..., channels], got shape {:?}",
                prior.shape()
            )));
        }
        if let Some(index) = config.extract_slice {
            prior = extract_slice(&prior, prior.ndim() - 2, index)?;
        }
        ensure_finite(&prior, "prior")?;

        let channels = prior.shape()[prior.ndim() - 1];
        let spatial = PatchSpec::new(prior.shape()[..prior.ndim() - 1].to_vec());
        let spatial = config
            .patch
            .or_else(|| input.config().patch.clone())
            .unwrap_or(spatial);
        let batch_size = input.batch_size();
        let patch_config = PatchStreamConfig::new(spatial.with_trailing_axis(channels))
            .batch_size(batch_size)
            .infinite(true)
            .collapse_axis(config.collapse_axis);
        let mut stream = PatchStream::negotiated_named("prior", prior, patch_config)?;
        stream.open(batch_size)?;

        Ok(Self {
            source,
            prior: stream,
            feed: config.feed,
            failed: false,
        })
    }

    /// Underlying pair source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Patches in the prior grid.
    pub fn prior_patches(&self) -> usize {
        self.prior.grid().len()
    }

    fn next_pair(&mut self) -> Result<TrainingPair> {
        let mut pair = self
            .source
            .pull_pair()
            .unwrap_or_else(|| Err(Error::Exhausted("pair source".into())))?;
        let size = pair
            .inputs
            .first()
            .map(realized_size)
            .ok_or_else(|| Error::InvalidDimensions("pair has no input".into()))?;
        let prior = self.prior.request_next(size)?;
        match self.feed {
            PriorFeed::Input => pair.inputs.push(prior),
            PriorFeed::Output => pair.outputs.push(prior),
        }
        Ok(pair)
    }
}

impl<S: PairSource> Iterator for PriorCoupler<S> {
    type Item = Result<TrainingPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_pair();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}
