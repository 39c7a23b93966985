//! Infinite batch stream over a directory of volumes.

use super::file_cycle::{CycleStep, FileCycle};
use super::grid::{PatchGrid, PatchSpec};
use super::patch::{PatchStream, PatchStreamConfig};
use super::{check_file_list, MismatchPolicy, Preprocess};
use crate::error::{Error, Result};
use crate::io::{FileLoader, VolumeLoader};
use crate::transforms::{LabelEncoding, RelabelMap};
use crate::volume::{concat_last_axis, ensure_finite, stack_samples, Batch, Volume};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Options for a [`VolumeStream`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolumeStreamConfig {
    /// Label used in logs and errors.
    pub name: String,
    /// File-name suffix; also selects the default loader.
    pub extension: String,
    /// Array key inside `.npz` files.
    pub npz_key: String,
    /// Samples per batch.
    pub batch_size: usize,
    /// Patch shape and stride; `None` yields whole volumes.
    pub patch: Option<PatchSpec>,
    /// Files per cycle; `None` means the file count.
    pub restart_cycle_length: Option<usize>,
    /// Label remapping applied after preprocessing.
    pub relabel: Option<RelabelMap>,
    /// Per-patch encoding.
    pub encoding: LabelEncoding,
    /// Patch axis to squeeze.
    pub collapse_axis: Option<usize>,
    /// Consecutive samples concatenated along the last axis into one.
    pub feature_group_size: usize,
    /// Flush the partial batch when the cycle ends.
    pub yield_incomplete_final_batch: bool,
    /// Seed for the file permutation.
    pub seed: Option<u64>,
    /// Fail unless exactly this many files are listed.
    pub expected_file_count: Option<usize>,
    /// Expected listing, checked per `mismatch_policy`.
    pub expected_files: Option<Vec<String>>,
    /// Reaction to an `expected_files` mismatch.
    pub mismatch_policy: MismatchPolicy,
    /// Log cycle starts, final batches and load times at info level.
    pub verbose: bool,
}

impl Default for VolumeStreamConfig {
    fn default() -> Self {
        Self {
            name: "single_vol".to_string(),
            extension: ".npz".to_string(),
            npz_key: "vol_data".to_string(),
            batch_size: 1,
            patch: None,
            restart_cycle_length: None,
            relabel: None,
            encoding: LabelEncoding::None,
            collapse_axis: None,
            feature_group_size: 1,
            yield_incomplete_final_batch: true,
            seed: None,
            expected_file_count: None,
            expected_files: None,
            mismatch_policy: MismatchPolicy::Warn,
            verbose: false,
        }
    }
}

impl VolumeStreamConfig {
    /// Parse from JSON, rejecting unknown keys.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config(format!("{}: batch_size must be at least 1", self.name)));
        }
        if self.feature_group_size == 0 {
            return Err(Error::config(format!(
                "{}: feature_group_size must be at least 1",
                self.name
            )));
        }
        if self.restart_cycle_length == Some(0) {
            return Err(Error::config(format!(
                "{}: restart_cycle_length must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Builder for [`VolumeStream`].
pub struct VolumeStreamBuilder {
    directory: PathBuf,
    config: VolumeStreamConfig,
    loader: Option<Box<dyn VolumeLoader>>,
    preprocess: Option<Preprocess>,
}

impl VolumeStreamBuilder {
    /// Transform each volume right after loading.
    #[must_use]
    pub fn preprocess<F>(mut self, f: F) -> Self
    where
        F: FnMut(Volume) -> Result<Volume> + 'static,
    {
        self.preprocess = Some(Box::new(f));
        self
    }

    pub(crate) fn preprocess_boxed(mut self, f: Option<Preprocess>) -> Self {
        self.preprocess = f;
        self
    }

    /// Replace the extension-selected [`FileLoader`].
    #[must_use]
    pub fn loader<L: VolumeLoader + 'static>(mut self, loader: L) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub(crate) fn loader_boxed(mut self, loader: Option<Box<dyn VolumeLoader>>) -> Self {
        self.loader = loader;
        self
    }

    /// List the directory, validate the configuration against the first
    /// volume and return the stream.
    pub fn open(self) -> Result<VolumeStream> {
        let Self {
            directory,
            config,
            loader,
            preprocess,
        } = self;
        config.validate()?;

        let cycle = FileCycle::create(&directory, &config.extension, config.seed)?;
        let file_count = cycle.file_count();
        if let Some(expected) = config.expected_file_count {
            if expected != file_count {
                return Err(Error::config(format!(
                    "{}: expected {} files in {}, found {}",
                    config.name,
                    expected,
                    directory.display(),
                    file_count
                )));
            }
        }
        if let Some(expected) = &config.expected_files {
            check_file_list(&config.name, expected, cycle.files(), config.mismatch_policy)?;
        }

        let loader = match loader {
            Some(loader) => loader,
            None => Box::new(
                FileLoader::for_extension(&config.extension)?
                    .npz_key(config.npz_key.clone())
                    .verbose(config.verbose),
            ),
        };

        let mut stream = VolumeStream {
            config,
            cycle,
            loader,
            preprocess,
            primed: None,
            volume_shape: Vec::new(),
            patches_per_volume: 0,
            step: None,
            patches: None,
            features: Vec::new(),
            failed: false,
        };

        let first = stream.cycle.files()[0].clone();
        let path = stream.cycle.directory().join(&first);
        let volume = stream.prepare(&path, &first, 0)?;
        let spec = stream.patch_spec(&volume);
        let grid = PatchGrid::for_spec(volume.shape(), &spec)?;
        grid.ensure_non_empty(&first)?;

        let cycle_length = stream.config.restart_cycle_length.unwrap_or(file_count);
        let capacity = file_count * grid.len();
        if cycle_length > capacity {
            return Err(Error::config(format!(
                "{}: restart cycle length {} exceeds {} files x {} patches",
                stream.config.name,
                cycle_length,
                file_count,
                grid.len()
            )));
        }
        stream.cycle = stream.cycle.with_cycle_length(cycle_length)?;
        stream.volume_shape = volume.shape().to_vec();
        stream.patches_per_volume = grid.len();
        stream.primed = Some(volume);

        debug!(
            name = %stream.config.name,
            directory = %directory.display(),
            file_count,
            cycle_length,
            patches_per_volume = grid.len(),
            "opened volume stream"
        );
        Ok(stream)
    }
}

/// Infinite stream of batches built from the volumes of one directory.
///
/// Each cycle step loads one file, preprocesses and relabels it, then walks
/// its patches one by one; samples are feature-grouped and stacked into
/// batches of `batch_size`. With `yield_incomplete_final_batch`, the partial
/// batch is flushed after the last patch of the cycle's last file.
pub struct VolumeStream {
    config: VolumeStreamConfig,
    cycle: FileCycle,
    loader: Box<dyn VolumeLoader>,
    preprocess: Option<Preprocess>,
    primed: Option<Volume>,
    volume_shape: Vec<usize>,
    patches_per_volume: usize,
    step: Option<CycleStep>,
    patches: Option<PatchStream>,
    features: Vec<ArrayD<f32>>,
    failed: bool,
}

impl VolumeStream {
    /// Start building a stream over `directory`.
    pub fn builder<P: AsRef<Path>>(
        directory: P,
        config: VolumeStreamConfig,
    ) -> VolumeStreamBuilder {
        VolumeStreamBuilder {
            directory: directory.as_ref().to_path_buf(),
            config,
            loader: None,
            preprocess: None,
        }
    }

    /// Open a stream with the default loader and no preprocessing.
    pub fn open<P: AsRef<Path>>(directory: P, config: VolumeStreamConfig) -> Result<Self> {
        Self::builder(directory, config).open()
    }

    /// Stream configuration.
    pub fn config(&self) -> &VolumeStreamConfig {
        &self.config
    }

    /// Ordered file names.
    pub fn files(&self) -> &[String] {
        self.cycle.files()
    }

    /// Number of listed files.
    pub fn file_count(&self) -> usize {
        self.cycle.file_count()
    }

    /// Files per cycle.
    pub fn cycle_length(&self) -> usize {
        self.cycle.cycle_length()
    }

    /// Configured batch size.
    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Patch count of the first volume.
    pub fn patches_per_volume(&self) -> usize {
        self.patches_per_volume
    }

    /// Shape of the first volume after preprocessing.
    pub fn volume_shape(&self) -> &[usize] {
        &self.volume_shape
    }

    fn patch_spec(&self, volume: &Volume) -> PatchSpec {
        match &self.config.patch {
            Some(spec) => spec.clone(),
            None => PatchSpec::new(volume.shape().to_vec()),
        }
    }

    /// Load, preprocess and relabel one file.
    fn prepare(&mut self, path: &Path, file: &str, index: usize) -> Result<Volume> {
        let volume = self.loader.load(path).map_err(|e| {
            error!(
                name = %self.config.name,
                file,
                index,
                cycle_length = self.cycle.cycle_length(),
                file_count = self.cycle.file_count(),
                error = %e,
                "failed to load volume"
            );
            e
        })?;
        let mut volume = match self.preprocess.as_mut() {
            Some(f) => f(volume)?,
            None => volume,
        };
        if let Some(map) = &self.config.relabel {
            map.apply(&mut volume);
        }
        Ok(volume)
    }

    fn start_next_file(&mut self) -> Result<()> {
        let step = self.cycle.advance();
        if step.starts_cycle {
            let cycle_length = self.cycle.cycle_length();
            if self.config.verbose {
                info!(name = %self.config.name, cycle_length, "starting cycle");
            } else {
                debug!(name = %self.config.name, cycle_length, "starting cycle");
            }
        }
        let volume = match self.primed.take() {
            Some(volume) => volume,
            None => self.prepare(&step.path, &step.file, step.index)?,
        };
        let config = PatchStreamConfig::new(self.patch_spec(&volume))
            .encoding(self.config.encoding)
            .collapse_axis(self.config.collapse_axis);
        self.patches = Some(PatchStream::named(step.file.clone(), volume, config)?);
        self.step = Some(step);
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Batch> {
        let batch_size = self.config.batch_size;
        let mut samples = Vec::with_capacity(batch_size);
        loop {
            if self.patches.is_none() {
                self.start_next_file()?;
            }
            let Some(patches) = self.patches.as_mut() else {
                continue;
            };
            let Some(patch) = patches.next().transpose()? else {
                self.patches = None;
                continue;
            };
            let last_of_file = patches.remaining() == 0;
            let (file, ends_cycle) = match &self.step {
                Some(step) => (step.file.as_str(), step.ends_cycle),
                None => ("", false),
            };

            let sample = patch.index_axis_move(Axis(0), 0);
            ensure_finite(&sample, file)?;
            self.features.push(sample);
            if self.features.len() < self.config.feature_group_size {
                continue;
            }
            samples.push(concat_last_axis(&self.features)?);
            self.features.clear();

            let final_batch =
                self.config.yield_incomplete_final_batch && ends_cycle && last_of_file;
            if final_batch {
                let size = samples.len();
                if self.config.verbose {
                    info!(name = %self.config.name, file, size, "last batch in cycle");
                } else {
                    debug!(name = %self.config.name, file, size, "last batch in cycle");
                }
            }
            if samples.len() == batch_size || final_batch {
                return stack_samples(&samples);
            }
        }
    }
}

impl Iterator for VolumeStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_batch();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

impl std::fmt::Debug for VolumeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeStream")
            .field("name", &self.config.name)
            .field("directory", &self.cycle.directory())
            .field("file_count", &self.cycle.file_count())
            .field("cycle_length", &self.cycle.cycle_length())
            .field("batch_size", &self.config.batch_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::npy::save_npz;
    use crate::volume::realized_size;
    use ndarray::IxDyn;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    fn write_volumes(count: usize, shape: &[usize]) -> TempDir {
        let dir = tempdir().unwrap();
        for i in 0..count {
            let volume = ArrayD::from_elem(IxDyn(shape), i as f32);
            save_npz(&volume, dir.path().join(format!("vol{}.npz", i)), "vol_data").unwrap();
        }
        dir
    }

    fn tiled(batch_size: usize) -> VolumeStreamConfig {
        VolumeStreamConfig {
            batch_size,
            patch: Some(PatchSpec::tiled(vec![4, 4, 4])),
            ..Default::default()
        }
    }

    #[test]
    fn test_cycle_batches_flush_at_end() {
        let dir = write_volumes(3, &[8, 8, 8]);
        let config = VolumeStreamConfig {
            restart_cycle_length: Some(3),
            seed: Some(3),
            ..tiled(5)
        };
        let stream = VolumeStream::open(dir.path(), config).unwrap();
        assert_eq!(stream.patches_per_volume(), 8);
        let batches: Vec<Batch> = stream.take(10).map(Result::unwrap).collect();
        let sizes: Vec<usize> = batches.iter().map(realized_size).collect();
        assert_eq!(sizes, vec![5, 5, 5, 5, 4, 5, 5, 5, 5, 4]);
        // the second cycle replays the first one
        assert_eq!(batches[0..5], batches[5..10]);
        // and spans every volume in between
        let first_cycle: f32 = batches[0..5].iter().map(|b| b.sum()).sum();
        assert_eq!(first_cycle, (0.0 + 1.0 + 2.0) * 8.0 * 64.0);
    }

    #[test]
    fn test_no_flush_carries_into_next_cycle() {
        let dir = write_volumes(3, &[8, 8, 8]);
        let config = VolumeStreamConfig {
            yield_incomplete_final_batch: false,
            ..tiled(5)
        };
        let sizes: Vec<usize> = VolumeStream::open(dir.path(), config)
            .unwrap()
            .take(6)
            .map(|b| realized_size(&b.unwrap()))
            .collect();
        assert_eq!(sizes, vec![5; 6]);
    }

    #[test]
    fn test_whole_volume_batches() {
        let dir = write_volumes(2, &[3, 4]);
        let config = VolumeStreamConfig {
            batch_size: 2,
            encoding: LabelEncoding::Channel,
            ..Default::default()
        };
        let mut stream = VolumeStream::open(dir.path(), config).unwrap();
        let batch = stream.next().unwrap().unwrap();
        assert_eq!(batch.shape(), &[2, 3, 4, 1]);
        assert_eq!(batch[[0, 0, 0, 0]], 0.0);
        assert_eq!(batch[[1, 0, 0, 0]], 1.0);
    }

    #[test]
    fn test_feature_grouping() {
        let dir = write_volumes(2, &[2, 2]);
        let config = VolumeStreamConfig {
            encoding: LabelEncoding::Channel,
            feature_group_size: 2,
            ..Default::default()
        };
        let batch = VolumeStream::open(dir.path(), config)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(batch.shape(), &[1, 2, 2, 2]);
        assert_eq!(batch[[0, 1, 1, 0]], 0.0);
        assert_eq!(batch[[0, 1, 1, 1]], 1.0);
    }

    #[test]
    fn test_relabel_after_preprocess() {
        let dir = tempdir().unwrap();
        let seg = ArrayD::from_shape_fn(IxDyn(&[3, 3]), |ix| [0.0, 5.0, 9.0][ix[0]]);
        save_npz(&seg, dir.path().join("s_aseg.npz"), "vol_data").unwrap();
        let config = VolumeStreamConfig {
            relabel: Some([(5, 1), (9, 2)].into_iter().collect()),
            ..Default::default()
        };
        let batch = VolumeStream::builder(dir.path(), config)
            .preprocess(|v| Ok(v.mapv(|x| if x == 9.0 { 5.0 } else { x })))
            .open()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(batch[[0, 1, 0]], 1.0);
        assert_eq!(batch[[0, 2, 0]], 1.0);
    }

    #[test]
    fn test_nan_names_file_and_fuses() {
        let dir = tempdir().unwrap();
        let good = ArrayD::<f32>::zeros(IxDyn(&[4, 4]));
        let mut bad = good.clone();
        bad[[3, 3]] = f32::NAN;
        save_npz(&good, dir.path().join("a.npz"), "vol_data").unwrap();
        save_npz(&bad, dir.path().join("b.npz"), "vol_data").unwrap();

        let config = VolumeStreamConfig {
            patch: Some(PatchSpec::tiled(vec![2, 2])),
            ..Default::default()
        };
        let mut stream = VolumeStream::open(dir.path(), config).unwrap();
        for _ in 0..4 {
            stream.next().unwrap().unwrap();
        }
        for _ in 0..3 {
            stream.next().unwrap().unwrap();
        }
        match stream.next() {
            Some(Err(Error::DataIntegrity { file, .. })) => assert_eq!(file, "b.npz"),
            other => panic!("expected integrity error, got {:?}", other),
        }
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_cycle_length_capacity() {
        let dir = write_volumes(2, &[8, 8, 8]);
        let config = VolumeStreamConfig {
            restart_cycle_length: Some(17),
            ..tiled(1)
        };
        assert!(matches!(
            VolumeStream::open(dir.path(), config),
            Err(Error::Configuration(_))
        ));
        let config = VolumeStreamConfig {
            restart_cycle_length: Some(0),
            ..tiled(1)
        };
        assert!(VolumeStream::open(dir.path(), config).is_err());
    }

    #[test]
    fn test_expected_file_count() {
        let dir = write_volumes(2, &[2, 2]);
        let config = VolumeStreamConfig {
            expected_file_count: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            VolumeStream::open(dir.path(), config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_grid_names_file() {
        let dir = write_volumes(1, &[2, 2, 2]);
        match VolumeStream::open(dir.path(), tiled(1)) {
            Err(Error::EmptyPatchGrid { source_name, .. }) => assert_eq!(source_name, "vol0.npz"),
            other => panic!("expected empty grid, got {:?}", other),
        }
    }

    #[test]
    fn test_first_volume_loaded_once() {
        let dir = write_volumes(2, &[2, 2]);
        let loads = Rc::new(Cell::new(0));
        let counter = Rc::clone(&loads);
        let loader = move |path: &Path| -> Result<Volume> {
            counter.set(counter.get() + 1);
            crate::io::npy::load_npz(path, "vol_data")
        };
        let mut stream = VolumeStream::builder(dir.path(), VolumeStreamConfig::default())
            .loader(loader)
            .open()
            .unwrap();
        assert_eq!(loads.get(), 1);
        stream.next().unwrap().unwrap();
        assert_eq!(loads.get(), 1);
        stream.next().unwrap().unwrap();
        assert_eq!(loads.get(), 2);
    }

    #[test]
    fn test_load_failure_is_reraised() {
        let dir = write_volumes(2, &[2, 2]);
        std::fs::write(dir.path().join("vol1.npz"), b"corrupt").unwrap();
        let mut stream = VolumeStream::open(dir.path(), VolumeStreamConfig::default()).unwrap();
        stream.next().unwrap().unwrap();
        assert!(matches!(stream.next(), Some(Err(Error::ReadNpz(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_config_json_rejects_unknown_keys() {
        let config = VolumeStreamConfig::from_json(
            r#"{"batch_size": 4, "patch": {"shape": [4, 4, 4], "stride": [4, 4, 4]}}"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.extension, ".npz");
        assert!(config.yield_incomplete_final_batch);
        assert!(matches!(
            VolumeStreamConfig::from_json(r#"{"batchsize": 4}"#),
            Err(Error::Json(_))
        ));
    }
}
