//! Streaming pipelines: patch grids, file cycles and the batch streams built
//! on them.
//!
//! Every stream is an [`Iterator`] of `Result` items that does work only when
//! pulled. Streams stop (return `None`) after yielding their first error.

pub mod extra;
pub mod file_cycle;
pub mod grid;
pub mod paired;
pub mod patch;
pub mod prior;
pub mod volume;

pub use file_cycle::{CycleStep, FileCycle};
pub use grid::{grid_size, PatchGrid, PatchSpec};
pub use paired::{PairedStream, PairedStreamBuilder, PairedStreamConfig};
pub use patch::{PatchStream, PatchStreamConfig};
pub use prior::{PriorConfig, PriorCoupler, PriorFeed, PriorSource};
pub use volume::{VolumeStream, VolumeStreamBuilder, VolumeStreamConfig};

use crate::error::{Error, Result};
use crate::volume::{Batch, Volume};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-volume callback run right after loading.
pub type Preprocess = Box<dyn FnMut(Volume) -> Result<Volume>>;

/// Reaction to a file listing that differs from the expected one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Log a warning and continue.
    #[default]
    Warn,
    /// Return [`Error::FileListMismatch`].
    Fail,
}

/// Compare listings. Returns whether they matched.
pub fn check_file_list(
    stream: &str,
    expected: &[String],
    actual: &[String],
    policy: MismatchPolicy,
) -> Result<bool> {
    let detail = if expected.len() != actual.len() {
        Some(format!(
            "expected {} files, found {}",
            expected.len(),
            actual.len()
        ))
    } else {
        expected
            .iter()
            .zip(actual)
            .enumerate()
            .find(|(_, (e, a))| e != a)
            .map(|(i, (e, a))| format!("entry {}: expected '{}', found '{}'", i, e, a))
    };
    match (detail, policy) {
        (None, _) => Ok(true),
        (Some(detail), MismatchPolicy::Warn) => {
            warn!(stream, %detail, "file lists do not match");
            Ok(false)
        }
        (Some(detail), MismatchPolicy::Fail) => Err(Error::FileListMismatch {
            stream: stream.to_string(),
            detail,
        }),
    }
}

/// Model inputs and outputs for one training step.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPair {
    /// Model inputs, in order.
    pub inputs: Vec<Batch>,
    /// Model outputs (targets), in order.
    pub outputs: Vec<Batch>,
}

impl TrainingPair {
    /// Single input, single output.
    pub fn new(input: Batch, output: Batch) -> Self {
        Self {
            inputs: vec![input],
            outputs: vec![output],
        }
    }
}

impl From<(Batch, Batch)> for TrainingPair {
    fn from((input, output): (Batch, Batch)) -> Self {
        Self::new(input, output)
    }
}

/// Pair stream whose first model input is drawn from a [`VolumeStream`].
///
/// [`PriorCoupler`] sizes and shapes its prior from that stream.
pub trait PairSource {
    /// Stream behind the first model input.
    fn input_stream(&self) -> &VolumeStream;

    /// Next pair, `None` once the source is fused after an error.
    fn pull_pair(&mut self) -> Option<Result<TrainingPair>>;
}

/// Random generator, seeded when reproducibility is requested.
#[allow(clippy::option_if_let_else)]
pub(crate) fn get_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}
