//! Slice-wise super-resolution batches.
//!
//! A slab of `(nb_input_slices - 1) * (slice_spacing + 1) + 1` consecutive
//! slices along the last axis is the target; the input keeps every
//! `(slice_spacing + 1)`-th slice of the same slab.

use crate::error::{Error, Result};
use crate::io::{FileLoader, VolumeLoader};
use crate::pipeline::file_cycle::FileCycle;
use crate::pipeline::{get_rng, TrainingPair};
use crate::volume::{stack_samples, Volume};
use ndarray::{Axis, IxDyn, Slice};
use rand::seq::index::sample;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, error};

/// How slab start positions are chosen within a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SliceSampling {
    /// One batch of distinct random starts per volume.
    #[default]
    Random,
    /// Consecutive starts 0, 1, 2, ...; full batches only.
    Sequential,
    /// Starts stepped by `slice_spacing + 1` so inputs tile a sparse volume;
    /// full batches only.
    SparseVolume {
        /// Offset the first start randomly.
        #[serde(default)]
        randomize_start: bool,
    },
}

/// Options for a [`SliceSuperResStream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SliceSuperResConfig {
    /// File-name suffix.
    pub extension: String,
    /// Array key inside `.npz` files.
    pub npz_key: String,
    /// Slices in each input sample.
    pub nb_input_slices: usize,
    /// Slices skipped between consecutive input slices.
    pub slice_spacing: usize,
    /// Samples per batch.
    pub batch_size: usize,
    /// Files per cycle; `None` means the file count.
    pub restart_cycle_length: Option<usize>,
    /// Seed for the file permutation and slab sampling.
    pub seed: Option<u64>,
    /// Start selection.
    pub sampling: SliceSampling,
}

impl Default for SliceSuperResConfig {
    fn default() -> Self {
        Self {
            extension: ".npz".to_string(),
            npz_key: "vol_data".to_string(),
            nb_input_slices: 2,
            slice_spacing: 1,
            batch_size: 1,
            restart_cycle_length: None,
            seed: None,
            sampling: SliceSampling::Random,
        }
    }
}

impl SliceSuperResConfig {
    /// Slices covered by one target slab.
    pub fn slab_depth(&self) -> usize {
        (self.nb_input_slices - 1) * (self.slice_spacing + 1) + 1
    }
}

/// Infinite stream of `(sparse slices, dense slab)` pairs.
///
/// Inputs are `[B, spatial..., nb_input_slices]`; outputs are reshaped to
/// `[B, voxels_per_slice, slab_depth]`.
pub struct SliceSuperResStream {
    config: SliceSuperResConfig,
    cycle: FileCycle,
    loader: Box<dyn VolumeLoader>,
    rng: ChaCha8Rng,
    current: Option<(Volume, VecDeque<Vec<usize>>)>,
    failed: bool,
}

impl SliceSuperResStream {
    /// Open over a directory of volumes.
    pub fn open<P: AsRef<Path>>(directory: P, config: SliceSuperResConfig) -> Result<Self> {
        if config.nb_input_slices == 0 || config.batch_size == 0 {
            return Err(Error::config(
                "nb_input_slices and batch_size must be at least 1",
            ));
        }
        let cycle = FileCycle::create(directory, &config.extension, config.seed)?;
        let cycle_length = config.restart_cycle_length.unwrap_or(cycle.file_count());
        let cycle = cycle.with_cycle_length(cycle_length)?;
        let loader = FileLoader::for_extension(&config.extension)?.npz_key(config.npz_key.clone());
        Ok(Self {
            rng: get_rng(config.seed),
            config,
            cycle,
            loader: Box::new(loader),
            current: None,
            failed: false,
        })
    }

    /// Replace the extension-selected loader.
    #[must_use]
    pub fn with_loader<L: VolumeLoader + 'static>(mut self, loader: L) -> Self {
        self.loader = Box::new(loader);
        self
    }

    /// Start positions for one volume, grouped into batches.
    fn plan(&mut self, nb_starts: usize, file: &str) -> Result<VecDeque<Vec<usize>>> {
        let batch_size = self.config.batch_size;
        let batches: VecDeque<Vec<usize>> = match self.config.sampling {
            SliceSampling::Random => {
                if nb_starts < batch_size {
                    VecDeque::new()
                } else {
                    let starts = sample(&mut self.rng, nb_starts, batch_size).into_vec();
                    VecDeque::from([starts])
                }
            }
            SliceSampling::Sequential => (0..nb_starts)
                .collect::<Vec<_>>()
                .chunks_exact(batch_size)
                .map(<[usize]>::to_vec)
                .collect(),
            SliceSampling::SparseVolume { randomize_start } => {
                let first = if randomize_start && nb_starts > 1 {
                    self.rng.gen_range(0..nb_starts - 1)
                } else {
                    0
                };
                (first..nb_starts)
                    .step_by(self.config.slice_spacing + 1)
                    .collect::<Vec<_>>()
                    .chunks_exact(batch_size)
                    .map(<[usize]>::to_vec)
                    .collect()
            }
        };
        if batches.is_empty() {
            return Err(Error::integrity(
                file,
                format!(
                    "{} slab start(s) cannot fill a batch of {}",
                    nb_starts, batch_size
                ),
            ));
        }
        Ok(batches)
    }

    fn load_next(&mut self) -> Result<()> {
        let step = self.cycle.advance();
        let volume = self.loader.load(&step.path).map_err(|e| {
            error!(
                file = %step.file,
                index = step.index,
                cycle_length = self.cycle.cycle_length(),
                file_count = self.cycle.file_count(),
                error = %e,
                "failed to load volume"
            );
            e
        })?;
        let depth = volume.shape().last().copied().unwrap_or(0);
        let slab = self.config.slab_depth();
        if volume.ndim() < 2 || depth < slab {
            return Err(Error::integrity(
                &step.file,
                format!(
                    "shape {:?} has fewer than {} slices in its last axis",
                    volume.shape(),
                    slab
                ),
            ));
        }
        let batches = self.plan(depth - slab + 1, &step.file)?;
        debug!(file = %step.file, batches = batches.len(), "planned slab batches");
        self.current = Some((volume, batches));
        Ok(())
    }

    fn next_pair(&mut self) -> Result<TrainingPair> {
        loop {
            if let Some((volume, batches)) = self.current.as_mut() {
                if let Some(starts) = batches.pop_front() {
                    return slab_batch(volume, &starts, &self.config);
                }
            }
            self.load_next()?;
        }
    }
}

fn slab_batch(
    volume: &Volume,
    starts: &[usize],
    config: &SliceSuperResConfig,
) -> Result<TrainingPair> {
    let last = Axis(volume.ndim() - 1);
    let slab = config.slab_depth();
    let step = (config.slice_spacing + 1) as isize;
    let mut inputs = Vec::with_capacity(starts.len());
    let mut outputs = Vec::with_capacity(starts.len());
    for &start in starts {
        outputs.push(volume.slice_axis(last, Slice::from(start..start + slab)).to_owned());
        inputs.push(
            volume
                .slice_axis(last, Slice::from(start..start + slab).step_by(step))
                .to_owned(),
        );
    }
    let input = stack_samples(&inputs)?;
    let output = stack_samples(&outputs)?;
    let per_slice = volume.len() / volume.shape()[last.index()];
    let output = output
        .into_shape_with_order(IxDyn(&[starts.len(), per_slice, slab]))
        .map_err(|e| Error::InvalidDimensions(format!("slab reshape: {}", e)))?;
    Ok(TrainingPair::new(input, output))
}

impl Iterator for SliceSuperResStream {
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

impl std::fmt::Debug for SliceSuperResStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceSuperResStream")
            .field("config", &self.config)
            .field("directory", &self.cycle.directory())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::npy::save_npz;
    use ndarray::ArrayD;
    use tempfile::{tempdir, TempDir};

    fn slices_dir(depth: usize) -> TempDir {
        let dir = tempdir().unwrap();
        let vol = ArrayD::from_shape_fn(IxDyn(&[2, 3, depth]), |ix| ix[2] as f32);
        save_npz(&vol, dir.path().join("v0.npz"), "vol_data").unwrap();
        dir
    }

    #[test]
    fn test_slab_depth() {
        let config = SliceSuperResConfig {
            nb_input_slices: 3,
            slice_spacing: 2,
            ..Default::default()
        };
        assert_eq!(config.slab_depth(), 7);
    }

    #[test]
    fn test_sequential_full_batches() {
        // depth 8, slab 3 => starts 0..=5, batches [0,1], [2,3], [4,5]
        let dir = slices_dir(8);
        let config = SliceSuperResConfig {
            batch_size: 2,
            sampling: SliceSampling::Sequential,
            ..Default::default()
        };
        let stream = SliceSuperResStream::open(dir.path(), config).unwrap();
        let pairs: Vec<TrainingPair> = stream.take(4).map(Result::unwrap).collect();

        let input = &pairs[1].inputs[0];
        assert_eq!(input.shape(), &[2, 2, 3, 2]);
        assert_eq!(input[[0, 0, 0, 0]], 2.0);
        assert_eq!(input[[0, 0, 0, 1]], 4.0);
        assert_eq!(input[[1, 0, 0, 1]], 5.0);

        let output = &pairs[1].outputs[0];
        assert_eq!(output.shape(), &[2, 6, 3]);
        assert_eq!(output[[0, 5, 1]], 3.0);

        // the fourth pair restarts the (single-file) cycle
        assert_eq!(pairs[3].inputs[0][[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_random_starts_are_distinct() {
        let dir = slices_dir(10);
        let config = SliceSuperResConfig {
            batch_size: 4,
            seed: Some(1),
            ..Default::default()
        };
        let mut stream = SliceSuperResStream::open(dir.path(), config).unwrap();
        let pair = stream.next().unwrap().unwrap();
        let mut starts: Vec<i64> = (0..4).map(|b| pair.inputs[0][[b, 0, 0, 0]] as i64).collect();
        starts.sort_unstable();
        starts.dedup();
        assert_eq!(starts.len(), 4);
        assert!(starts.iter().all(|&s| (0..8).contains(&s)));
    }

    #[test]
    fn test_sparse_volume_steps_by_spacing() {
        // depth 9, slab 3, spacing 1 => starts 0, 2, 4, 6
        let dir = slices_dir(9);
        let config = SliceSuperResConfig {
            batch_size: 2,
            sampling: SliceSampling::SparseVolume {
                randomize_start: false,
            },
            ..Default::default()
        };
        let mut stream = SliceSuperResStream::open(dir.path(), config).unwrap();
        let first = stream.next().unwrap().unwrap();
        let second = stream.next().unwrap().unwrap();
        assert_eq!(first.inputs[0][[1, 0, 0, 0]], 2.0);
        assert_eq!(second.inputs[0][[0, 0, 0, 0]], 4.0);
        assert_eq!(second.inputs[0][[1, 0, 0, 0]], 6.0);
    }

    #[test]
    fn test_too_thin_volume_is_integrity_error() {
        let dir = slices_dir(2);
        let mut stream =
            SliceSuperResStream::open(dir.path(), SliceSuperResConfig::default()).unwrap();
        assert!(matches!(stream.next(), Some(Err(Error::DataIntegrity { .. }))));
        assert!(stream.next().is_none());
    }
}
