//! Synchronized `(input, target)` batches from two directories.

use super::volume::{VolumeStream, VolumeStreamConfig};
use super::{MismatchPolicy, PairSource, Preprocess, TrainingPair};
use crate::error::{Error, Result};
use crate::io::VolumeLoader;
use crate::transforms::LabelEncoding;
use crate::volume::{realized_size, Batch, Volume};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options for a [`PairedStream`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PairedStreamConfig {
    /// Label used in logs and errors.
    pub name: String,
    /// Input (volume) side.
    pub input: VolumeStreamConfig,
    /// Target (segmentation) side.
    pub target: VolumeStreamConfig,
    /// Token in input file names replaced to derive target names.
    pub input_token: String,
    /// Replacement token for target file names.
    pub target_token: String,
    /// Reaction to a target listing that does not match the input listing.
    pub mismatch_policy: MismatchPolicy,
}

impl Default for PairedStreamConfig {
    fn default() -> Self {
        Self::shared(VolumeStreamConfig::default())
    }
}

impl PairedStreamConfig {
    /// Derive both sides from one configuration.
    ///
    /// The input side gets a channel axis and no relabelling; the target keeps
    /// the base encoding and relabel map. Both sides keep the base feature
    /// grouping so they draw the same number of samples per cycle.
    pub fn shared(base: VolumeStreamConfig) -> Self {
        let name = "vol_seg".to_string();
        let input = VolumeStreamConfig {
            name: format!("{} vol", name),
            encoding: LabelEncoding::Channel,
            relabel: None,
            ..base.clone()
        };
        let target = VolumeStreamConfig {
            name: format!("{} seg", name),
            verbose: false,
            ..base
        };
        Self {
            name,
            input,
            target,
            input_token: "norm".to_string(),
            target_token: "aseg".to_string(),
            mismatch_policy: MismatchPolicy::Warn,
        }
    }

    /// Parse from JSON, rejecting unknown keys.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Target names expected for an input listing.
    pub fn expected_targets(&self, inputs: &[String]) -> Vec<String> {
        inputs
            .iter()
            .map(|f| f.replace(&self.input_token, &self.target_token))
            .collect()
    }
}

/// Builder for [`PairedStream`].
pub struct PairedStreamBuilder {
    input_dir: PathBuf,
    target_dir: PathBuf,
    config: PairedStreamConfig,
    input_preprocess: Option<Preprocess>,
    target_preprocess: Option<Preprocess>,
    input_loader: Option<Box<dyn VolumeLoader>>,
    target_loader: Option<Box<dyn VolumeLoader>>,
}

impl PairedStreamBuilder {
    /// Transform each input volume after loading.
    #[must_use]
    pub fn input_preprocess<F>(mut self, f: F) -> Self
    where
        F: FnMut(Volume) -> Result<Volume> + 'static,
    {
        self.input_preprocess = Some(Box::new(f));
        self
    }

    /// Transform each target volume after loading.
    #[must_use]
    pub fn target_preprocess<F>(mut self, f: F) -> Self
    where
        F: FnMut(Volume) -> Result<Volume> + 'static,
    {
        self.target_preprocess = Some(Box::new(f));
        self
    }

    /// Loader for the input side.
    #[must_use]
    pub fn input_loader<L: VolumeLoader + 'static>(mut self, loader: L) -> Self {
        self.input_loader = Some(Box::new(loader));
        self
    }

    /// Loader for the target side.
    #[must_use]
    pub fn target_loader<L: VolumeLoader + 'static>(mut self, loader: L) -> Self {
        self.target_loader = Some(Box::new(loader));
        self
    }

    /// Open both sides and check that they line up.
    pub fn open(self) -> Result<PairedStream> {
        let Self {
            input_dir,
            target_dir,
            config,
            input_preprocess,
            target_preprocess,
            input_loader,
            target_loader,
        } = self;

        let input = VolumeStream::builder(&input_dir, config.input.clone())
            .preprocess_boxed(input_preprocess)
            .loader_boxed(input_loader)
            .open()?;

        let target_config = VolumeStreamConfig {
            expected_files: Some(config.expected_targets(input.files())),
            mismatch_policy: config.mismatch_policy,
            ..config.target.clone()
        };
        let target = VolumeStream::builder(&target_dir, target_config)
            .preprocess_boxed(target_preprocess)
            .loader_boxed(target_loader)
            .open()?;

        if input.cycle_length() != target.cycle_length() {
            return Err(Error::config(format!(
                "{}: input cycle length {} differs from target cycle length {}",
                config.name,
                input.cycle_length(),
                target.cycle_length()
            )));
        }
        if input.batch_size() != target.batch_size() {
            return Err(Error::config(format!(
                "{}: input batch size {} differs from target batch size {}",
                config.name,
                input.batch_size(),
                target.batch_size()
            )));
        }
        let (input_plan, target_plan) = (sample_plan(&input), sample_plan(&target));
        if input_plan != target_plan {
            return Err(Error::config(format!(
                "{}: input draws {} patches per cycle in groups of {} (final flush {}), \
                 target draws {} in groups of {} (final flush {})",
                config.name,
                input_plan.0,
                input_plan.1,
                input_plan.2,
                target_plan.0,
                target_plan.1,
                target_plan.2
            )));
        }

        Ok(PairedStream {
            config,
            input,
            target,
            failed: false,
        })
    }
}

/// Infinite stream of `(input, target)` batches pulled in lock-step.
#[derive(Debug)]
pub struct PairedStream {
    config: PairedStreamConfig,
    input: VolumeStream,
    target: VolumeStream,
    failed: bool,
}

impl PairedStream {
    /// Start building a paired stream.
    pub fn builder<P: AsRef<Path>, Q: AsRef<Path>>(
        input_dir: P,
        target_dir: Q,
        config: PairedStreamConfig,
    ) -> PairedStreamBuilder {
        PairedStreamBuilder {
            input_dir: input_dir.as_ref().to_path_buf(),
            target_dir: target_dir.as_ref().to_path_buf(),
            config,
            input_preprocess: None,
            target_preprocess: None,
            input_loader: None,
            target_loader: None,
        }
    }

    /// Open with default loaders and no preprocessing.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        input_dir: P,
        target_dir: Q,
        config: PairedStreamConfig,
    ) -> Result<Self> {
        Self::builder(input_dir, target_dir, config).open()
    }

    /// Stream configuration.
    pub fn config(&self) -> &PairedStreamConfig {
        &self.config
    }

    /// Input side.
    pub fn input(&self) -> &VolumeStream {
        &self.input
    }

    /// Target side.
    pub fn target(&self) -> &VolumeStream {
        &self.target
    }

    /// Shared batch size.
    pub fn batch_size(&self) -> usize {
        self.input.batch_size()
    }

    /// Shared cycle length.
    pub fn cycle_length(&self) -> usize {
        self.input.cycle_length()
    }

    fn next_pair(&mut self) -> Result<(Batch, Batch)> {
        let input = self.pull_input()?;
        let target = self.pull_target()?;
        if realized_size(&input) != realized_size(&target) {
            return Err(Error::integrity(
                &self.config.name,
                format!(
                    "input batch of {} samples paired with target batch of {}",
                    realized_size(&input),
                    realized_size(&target)
                ),
            ));
        }
        Ok((input, target))
    }

    fn pull_input(&mut self) -> Result<Batch> {
        self.input
            .next()
            .unwrap_or_else(|| Err(Error::Exhausted(format!("{} input", self.config.name))))
    }

    fn pull_target(&mut self) -> Result<Batch> {
        self.target
            .next()
            .unwrap_or_else(|| Err(Error::Exhausted(format!("{} target", self.config.name))))
    }
}

/// Patches per cycle, feature group size and final-flush flag of one side.
fn sample_plan(stream: &VolumeStream) -> (usize, usize, bool) {
    let config = stream.config();
    (
        stream.cycle_length() * stream.patches_per_volume(),
        config.feature_group_size,
        config.yield_incomplete_final_batch,
    )
}

impl PairSource for PairedStream {
    fn input_stream(&self) -> &VolumeStream {
        &self.input
    }

    fn pull_pair(&mut self) -> Option<Result<TrainingPair>> {
        self.next().map(|pair| pair.map(TrainingPair::from))
    }
}

impl Iterator for PairedStream {
    type Item = Result<(Batch, Batch)>;

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
