//! Per-subject external data batched alongside volume patches.
//!
//! Each data file holds one flat vector per subject, one value per field.
//! Categorical fields are one-hot encoded to `[B, 1, nb_classes]`; the other
//! fields are kept as `[B, 1, 1]` scalars. A subject's vector is repeated once
//! per patch of its volume so it lines up with a [`VolumeStream`].

use crate::error::{Error, Result};
use crate::io::{FileLoader, VolumeLoader};
use crate::pipeline::file_cycle::{CycleStep, FileCycle};
use crate::pipeline::volume::{VolumeStream, VolumeStreamConfig};
use crate::pipeline::{check_file_list, MismatchPolicy, PairSource, TrainingPair};
use crate::transforms::LabelEncoding;
use crate::volume::{ensure_finite, realized_size, stack_samples, Batch, Volume};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, error, info};

/// Options for an [`ExtDataStream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtDataConfig {
    /// Label used in logs and errors.
    pub name: String,
    /// File-name suffix; also selects the loader.
    pub extension: String,
    /// Samples per batch.
    pub batch_size: usize,
    /// Times each file's vector is emitted before moving on.
    pub samples_per_file: usize,
    /// Class count per field; `None` keeps the field as a scalar. Empty means
    /// every field is a scalar.
    pub field_classes: Vec<Option<usize>>,
    /// Files per cycle; `None` means the file count.
    pub restart_cycle_length: Option<usize>,
    /// Flush the partial batch when the cycle ends.
    pub yield_incomplete_final_batch: bool,
    /// Seed for the file permutation.
    pub seed: Option<u64>,
    /// Expected listing, checked per `mismatch_policy`.
    pub expected_files: Option<Vec<String>>,
    /// Reaction to an `expected_files` mismatch.
    pub mismatch_policy: MismatchPolicy,
    /// Log cycle starts at info level.
    pub verbose: bool,
}

impl Default for ExtDataConfig {
    fn default() -> Self {
        Self {
            name: "ext_data".to_string(),
            extension: ".npy".to_string(),
            batch_size: 1,
            samples_per_file: 1,
            field_classes: Vec::new(),
            restart_cycle_length: None,
            yield_incomplete_final_batch: true,
            seed: None,
            expected_files: None,
            mismatch_policy: MismatchPolicy::Warn,
            verbose: false,
        }
    }
}

/// Infinite stream of per-field batches read from a directory of vectors.
pub struct ExtDataStream {
    config: ExtDataConfig,
    cycle: FileCycle,
    loader: Box<dyn VolumeLoader>,
    current: Option<(CycleStep, Vec<Volume>)>,
    repeats_left: usize,
    nb_fields: Option<usize>,
    pending: Vec<Vec<Volume>>,
    failed: bool,
}

impl ExtDataStream {
    /// List the data directory and check it against the expected files.
    pub fn open<P: AsRef<Path>>(directory: P, config: ExtDataConfig) -> Result<Self> {
        if config.batch_size == 0 || config.samples_per_file == 0 {
            return Err(Error::config(format!(
                "{}: batch_size and samples_per_file must be at least 1",
                config.name
            )));
        }
        if config.field_classes.contains(&Some(0)) {
            return Err(Error::config(format!(
                "{}: categorical fields need at least one class",
                config.name
            )));
        }

        let cycle = FileCycle::create(directory, &config.extension, config.seed)?;
        if let Some(expected) = &config.expected_files {
            check_file_list(&config.name, expected, cycle.files(), config.mismatch_policy)?;
        }
        let file_count = cycle.file_count();
        let cycle_length = config.restart_cycle_length.unwrap_or(file_count);
        if cycle_length > file_count * config.samples_per_file {
            return Err(Error::config(format!(
                "{}: restart cycle length {} exceeds {} files x {} samples",
                config.name, cycle_length, file_count, config.samples_per_file
            )));
        }
        let cycle = cycle.with_cycle_length(cycle_length)?;
        let loader = FileLoader::for_extension(&config.extension)?.verbose(config.verbose);

        debug!(
            name = %config.name,
            directory = %cycle.directory().display(),
            file_count,
            cycle_length,
            "opened external data stream"
        );
        Ok(Self {
            config,
            cycle,
            loader: Box::new(loader),
            current: None,
            repeats_left: 0,
            nb_fields: None,
            pending: Vec::new(),
            failed: false,
        })
    }

    /// Replace the extension-selected loader.
    #[must_use]
    pub fn with_loader<L: VolumeLoader + 'static>(mut self, loader: L) -> Self {
        self.loader = Box::new(loader);
        self
    }

    /// Stream configuration.
    pub fn config(&self) -> &ExtDataConfig {
        &self.config
    }

    /// Ordered data file names.
    pub fn files(&self) -> &[String] {
        self.cycle.files()
    }

    /// Files per cycle.
    pub fn cycle_length(&self) -> usize {
        self.cycle.cycle_length()
    }

    /// One `[1, nb_classes]` or `[1, 1]` array per field.
    fn encode_fields(&self, data: &Volume, file: &str) -> Result<Vec<Volume>> {
        let classes = &self.config.field_classes;
        if data.is_empty() {
            return Err(Error::integrity(file, "holds no values"));
        }
        if !classes.is_empty() && classes.len() != data.len() {
            return Err(Error::integrity(
                file,
                format!("holds {} values, expected {} fields", data.len(), classes.len()),
            ));
        }
        data.iter()
            .enumerate()
            .map(|(k, &v)| {
                let encoding = match classes.get(k).copied().flatten() {
                    Some(nb_labels) => LabelEncoding::Categorical {
                        nb_labels,
                        keep_shape: true,
                    },
                    None => LabelEncoding::Channel,
                };
                encoding.apply(ArrayD::from_elem(IxDyn(&[1]), v), file)
            })
            .collect()
    }

    fn load_next(&mut self) -> Result<()> {
        let step = self.cycle.advance();
        if step.starts_cycle {
            let cycle_length = self.cycle.cycle_length();
            if self.config.verbose {
                info!(name = %self.config.name, cycle_length, "starting cycle");
            } else {
                debug!(name = %self.config.name, cycle_length, "starting cycle");
            }
        }
        let data = self.loader.load(&step.path).map_err(|e| {
            error!(
                name = %self.config.name,
                file = %step.file,
                index = step.index,
                cycle_length = self.cycle.cycle_length(),
                file_count = self.cycle.file_count(),
                error = %e,
                "failed to load external data"
            );
            e
        })?;
        ensure_finite(&data, &step.file)?;
        let fields = self.encode_fields(&data, &step.file)?;
        match self.nb_fields {
            Some(n) if n != fields.len() => {
                return Err(Error::integrity(
                    &step.file,
                    format!("holds {} fields, earlier files hold {}", fields.len(), n),
                ));
            }
            _ => self.nb_fields = Some(fields.len()),
        }
        self.repeats_left = self.config.samples_per_file;
        self.current = Some((step, fields));
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Vec<Batch>> {
        loop {
            if self.repeats_left == 0 {
                self.load_next()?;
            }
            let (step, fields) = self
                .current
                .as_ref()
                .ok_or_else(|| Error::Exhausted(format!("{} data", self.config.name)))?;
            let ends_cycle = step.ends_cycle;
            self.pending.push(fields.clone());
            self.repeats_left -= 1;

            let final_batch =
                self.config.yield_incomplete_final_batch && ends_cycle && self.repeats_left == 0;
            if self.pending.len() == self.config.batch_size || final_batch {
                return self.flush();
            }
        }
    }

    /// Stack pending samples field by field.
    fn flush(&mut self) -> Result<Vec<Batch>> {
        let samples = std::mem::take(&mut self.pending);
        let nb_fields = samples.first().map_or(0, Vec::len);
        (0..nb_fields)
            .map(|k| {
                let column: Vec<Volume> = samples.iter().map(|s| s[k].clone()).collect();
                stack_samples(&column)
            })
            .collect()
    }
}

impl Iterator for ExtDataStream {
    type Item = Result<Vec<Batch>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_batch();
        self.failed = result.is_err();
        Some(result)
    }
}

impl std::fmt::Debug for ExtDataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtDataStream")
            .field("name", &self.config.name)
            .field("directory", &self.cycle.directory())
            .field("cycle_length", &self.cycle.cycle_length())
            .finish_non_exhaustive()
    }
}

/// Options for a [`VolExtDataStream`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolExtDataConfig {
    /// Label used in logs and errors.
    pub name: String,
    /// Volume side; its batch size, seed, cycle and flush rule drive both sides.
    pub input: VolumeStreamConfig,
    /// Data file suffix.
    pub extension: String,
    /// Class count per data field.
    pub field_classes: Vec<Option<usize>>,
    /// Token in volume file names replaced to derive data names.
    pub input_token: String,
    /// Replacement token for data file names.
    pub data_token: String,
    /// Reaction to a data listing that does not match the volume listing.
    pub mismatch_policy: MismatchPolicy,
}

impl Default for VolExtDataConfig {
    fn default() -> Self {
        let name = "vol_ext_data".to_string();
        Self {
            input: VolumeStreamConfig {
                name: format!("{} vol", name),
                encoding: LabelEncoding::Channel,
                ..Default::default()
            },
            name,
            extension: ".npy".to_string(),
            field_classes: Vec::new(),
            input_token: "norm".to_string(),
            data_token: "norm".to_string(),
            mismatch_policy: MismatchPolicy::Warn,
        }
    }
}

impl VolExtDataConfig {
    /// Parse from JSON, rejecting unknown keys.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Data file names expected for a volume listing.
    pub fn expected_data_files(&self, inputs: &[String]) -> Vec<String> {
        inputs
            .iter()
            .map(|f| {
                let stem = f.strip_suffix(self.input.extension.as_str()).unwrap_or(f);
                format!(
                    "{}{}",
                    stem.replace(&self.input_token, &self.data_token),
                    self.extension
                )
            })
            .collect()
    }
}

/// Volume batches paired with the external data of the same subjects:
/// inputs `[volume]`, outputs one batch per data field.
#[derive(Debug)]
pub struct VolExtDataStream {
    config: VolExtDataConfig,
    input: VolumeStream,
    data: ExtDataStream,
    failed: bool,
}

impl VolExtDataStream {
    /// Open the volume stream, then the data stream in step with it.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        input_dir: P,
        data_dir: Q,
        config: VolExtDataConfig,
    ) -> Result<Self> {
        if config.input.feature_group_size != 1 {
            return Err(Error::config(format!(
                "{}: external data cannot follow feature grouping of {}",
                config.name, config.input.feature_group_size
            )));
        }
        let input = VolumeStream::open(input_dir, config.input.clone())?;
        let data_config = ExtDataConfig {
            name: format!("{} ext_data", config.name),
            extension: config.extension.clone(),
            batch_size: input.batch_size(),
            samples_per_file: input.patches_per_volume(),
            field_classes: config.field_classes.clone(),
            restart_cycle_length: Some(input.cycle_length()),
            yield_incomplete_final_batch: input.config().yield_incomplete_final_batch,
            seed: input.config().seed,
            expected_files: Some(config.expected_data_files(input.files())),
            mismatch_policy: config.mismatch_policy,
            verbose: false,
        };
        let data = ExtDataStream::open(data_dir, data_config)?;
        Ok(Self {
            config,
            input,
            data,
            failed: false,
        })
    }

    /// Stream configuration.
    pub fn config(&self) -> &VolExtDataConfig {
        &self.config
    }

    /// External data side.
    pub fn data(&self) -> &ExtDataStream {
        &self.data
    }

    fn next_pair(&mut self) -> Result<TrainingPair> {
        let input = self
            .input
            .next()
            .unwrap_or_else(|| Err(Error::Exhausted(format!("{} input", self.config.name))))?;
        let fields = self
            .data
            .next()
            .unwrap_or_else(|| Err(Error::Exhausted(format!("{} data", self.config.name))))?;
        let data_size = fields.first().map_or(0, realized_size);
        if data_size != realized_size(&input) {
            return Err(Error::integrity(
                &self.config.name,
                format!(
                    "input batch of {} samples paired with data batch of {}",
                    realized_size(&input),
                    data_size
                ),
            ));
        }
        Ok(TrainingPair {
            inputs: vec![input],
            outputs: fields,
        })
    }
}

impl Iterator for VolExtDataStream {
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

impl PairSource for VolExtDataStream {
    fn input_stream(&self) -> &VolumeStream {
        &self.input
    }

    fn pull_pair(&mut self) -> Option<Result<TrainingPair>> {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::npy::{save_npy, save_npz};
    use crate::pipeline::{PatchSpec, PriorConfig, PriorCoupler, PriorFeed};
    use ndarray::arr1;
    use tempfile::{tempdir, TempDir};

    fn write_vectors(rows: &[[f32; 3]]) -> TempDir {
        let dir = tempdir().unwrap();
        for (i, row) in rows.iter().enumerate() {
            let vector = arr1(row).into_dyn();
            save_npy(&vector, dir.path().join(format!("s{}_norm.npy", i))).unwrap();
        }
        dir
    }

    fn subjects(count: usize) -> (TempDir, TempDir) {
        let vols = tempdir().unwrap();
        let data = tempdir().unwrap();
        for i in 0..count {
            let vol = ArrayD::from_elem(IxDyn(&[4, 4, 4]), i as f32);
            save_npz(&vol, vols.path().join(format!("s{}_norm.npz", i)), "vol_data").unwrap();
            let vector = arr1(&[i as f32, 10.0 + i as f32]).into_dyn();
            save_npy(&vector, data.path().join(format!("s{}_norm.npy", i))).unwrap();
        }
        (vols, data)
    }

    fn vol_config(batch_size: usize) -> VolExtDataConfig {
        let base = VolExtDataConfig::default();
        VolExtDataConfig {
            input: VolumeStreamConfig {
                batch_size,
                patch: Some(PatchSpec::tiled(vec![2, 2, 2])),
                seed: Some(4),
                ..base.input.clone()
            },
            field_classes: vec![Some(3), None],
            ..base
        }
    }

    #[test]
    fn test_fields_encoded_and_repeated() {
        let dir = write_vectors(&[[0.0, 1.0, 0.5], [2.0, 0.0, 1.5], [1.0, 1.0, 2.5]]);
        let config = ExtDataConfig {
            batch_size: 4,
            samples_per_file: 2,
            field_classes: vec![Some(3), Some(2), None],
            ..Default::default()
        };
        let stream = ExtDataStream::open(dir.path(), config).unwrap();
        let batches: Vec<Vec<Batch>> = stream.take(4).map(Result::unwrap).collect();

        // 3 files x 2 samples => 4, 2 per cycle
        let sizes: Vec<usize> = batches.iter().map(|b| realized_size(&b[0])).collect();
        assert_eq!(sizes, vec![4, 2, 4, 2]);

        let first = &batches[0];
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].shape(), &[4, 1, 3]);
        assert_eq!(first[1].shape(), &[4, 1, 2]);
        assert_eq!(first[2].shape(), &[4, 1, 1]);
        // samples 2 and 3 come from s1: class 2, class 0, value 1.5
        assert_eq!(first[0][[2, 0, 2]], 1.0);
        assert_eq!(first[0][[3, 0, 0]], 0.0);
        assert_eq!(first[1][[3, 0, 0]], 1.0);
        assert_eq!(first[2][[3, 0, 0]], 1.5);
    }

    #[test]
    fn test_out_of_range_class_names_file() {
        let dir = write_vectors(&[[0.0, 1.0, 0.5], [4.0, 0.0, 1.5]]);
        let config = ExtDataConfig {
            field_classes: vec![Some(3), Some(2), None],
            ..Default::default()
        };
        let mut stream = ExtDataStream::open(dir.path(), config).unwrap();
        assert!(stream.next().unwrap().is_ok());
        match stream.next() {
            Some(Err(Error::DataIntegrity { file, .. })) => assert_eq!(file, "s1_norm.npy"),
            other => panic!("expected integrity error, got {:?}", other),
        }
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_field_count_mismatch() {
        let dir = write_vectors(&[[0.0, 1.0, 0.5]]);
        let config = ExtDataConfig {
            field_classes: vec![Some(3), None],
            ..Default::default()
        };
        let mut stream = ExtDataStream::open(dir.path(), config).unwrap();
        assert!(matches!(
            stream.next(),
            Some(Err(Error::DataIntegrity { .. }))
        ));
    }

    #[test]
    fn test_volume_and_data_stay_in_step() {
        // 3 volumes x 8 patches, batch 5 => 5, 5, 5, 5, 4
        let (vols, data) = subjects(3);
        let stream = VolExtDataStream::open(vols.path(), data.path(), vol_config(5)).unwrap();
        assert_eq!(stream.data().cycle_length(), 3);

        let mut sizes = Vec::new();
        for pair in stream.take(10) {
            let pair = pair.unwrap();
            let input = &pair.inputs[0];
            assert_eq!(&input.shape()[1..], &[2, 2, 2, 1]);
            assert_eq!(pair.outputs.len(), 2);
            for b in 0..realized_size(input) {
                let subject = input[[b, 0, 0, 0, 0]];
                assert_eq!(pair.outputs[0][[b, 0, subject as usize]], 1.0);
                assert_eq!(pair.outputs[1][[b, 0, 0]], 10.0 + subject);
            }
            sizes.push(realized_size(input));
        }
        assert_eq!(sizes, vec![5, 5, 5, 5, 4, 5, 5, 5, 5, 4]);
    }

    #[test]
    fn test_expected_data_names() {
        let config = VolExtDataConfig {
            data_token: "info".into(),
            ..Default::default()
        };
        assert_eq!(
            config.expected_data_files(&["s1_norm.npz".to_string()]),
            vec!["s1_info.npy".to_string()]
        );
    }

    #[test]
    fn test_feature_grouping_rejected() {
        let (vols, data) = subjects(1);
        let mut config = vol_config(2);
        config.input.feature_group_size = 2;
        assert!(matches!(
            VolExtDataStream::open(vols.path(), data.path(), config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_prior_attached_to_data_outputs() {
        let (vols, data) = subjects(3);
        let source = VolExtDataStream::open(vols.path(), data.path(), vol_config(5)).unwrap();
        let prior = PriorConfig {
            feed: PriorFeed::Output,
            ..Default::default()
        };
        let coupler = PriorCoupler::open(source, prior).unwrap();
        for pair in coupler.take(5) {
            let pair = pair.unwrap();
            assert_eq!(pair.outputs.len(), 3);
            let size = realized_size(&pair.inputs[0]);
            assert_eq!(pair.outputs[2].shape(), &[size, 2, 2, 2, 3]);
        }
    }
}
