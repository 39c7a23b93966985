//! Volume classification batches from class sub-folders.

use crate::error::{Error, Result};
use crate::io::list_subdirectories;
use crate::pipeline::volume::{VolumeStream, VolumeStreamConfig};
use crate::pipeline::{get_rng, TrainingPair};
use crate::transforms::LabelEncoding;
use ndarray::Array2;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use tracing::debug;

/// Batches drawn from one class folder at a time, paired with the one-hot
/// class `[B, nb_classes]`.
///
/// Each pass visits every class once per file it holds, in an order shuffled
/// by a ChaCha8 generator seeded from the configuration seed.
#[derive(Debug)]
pub struct CategoryStream {
    classes: Vec<String>,
    streams: Vec<VolumeStream>,
    order: Vec<usize>,
    position: usize,
    rng: ChaCha8Rng,
    failed: bool,
}

impl CategoryStream {
    /// Open one volume stream per sub-folder of `directory`, sorted by name.
    /// Every stream uses `config` with a channel encoding.
    pub fn open<P: AsRef<Path>>(directory: P, config: VolumeStreamConfig) -> Result<Self> {
        let directory = directory.as_ref();
        let classes = list_subdirectories(directory)?;
        if classes.is_empty() {
            return Err(Error::config(format!(
                "no class folders found in {}",
                directory.display()
            )));
        }
        let streams = classes
            .iter()
            .map(|class| {
                let class_config = VolumeStreamConfig {
                    name: class.clone(),
                    encoding: LabelEncoding::Channel,
                    ..config.clone()
                };
                VolumeStream::open(directory.join(class), class_config)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            directory = %directory.display(),
            classes = ?classes,
            "opened category stream"
        );
        Ok(Self {
            classes,
            streams,
            order: Vec::new(),
            position: 0,
            rng: get_rng(config.seed),
            failed: false,
        })
    }

    /// Class folder names; index `k` is one-hot column `k`.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    fn refill_order(&mut self) {
        self.order = self
            .streams
            .iter()
            .enumerate()
            .flat_map(|(k, s)| std::iter::repeat(k).take(s.file_count()))
            .collect();
        self.order.shuffle(&mut self.rng);
        self.position = 0;
    }

    fn next_pair(&mut self) -> Result<TrainingPair> {
        if self.position >= self.order.len() {
            self.refill_order();
        }
        let class = self.order[self.position];
        self.position += 1;

        let data = self.streams[class].next().unwrap_or_else(|| {
            Err(Error::Exhausted(format!("class {}", self.classes[class])))
        })?;
        let mut label = Array2::<f32>::zeros((data.shape()[0], self.classes.len()));
        label.column_mut(class).fill(1.0);
        Ok(TrainingPair::new(data, label.into_dyn()))
    }
}

impl Iterator for CategoryStream {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::npy::save_npz;
    use ndarray::{ArrayD, IxDyn};
    use tempfile::tempdir;

    #[test]
    fn test_each_class_once_per_file() {
        let dir = tempdir().unwrap();
        for (class, files) in [("healthy", 2usize), ("lesion", 3)] {
            let sub = dir.path().join(class);
            std::fs::create_dir(&sub).unwrap();
            let value = if class == "healthy" { 0.0 } else { 1.0 };
            for i in 0..files {
                let vol = ArrayD::from_elem(IxDyn(&[2, 2]), value);
                save_npz(&vol, sub.join(format!("v{}.npz", i)), "vol_data").unwrap();
            }
        }
        let config = VolumeStreamConfig {
            seed: Some(5),
            ..Default::default()
        };
        let stream = CategoryStream::open(dir.path(), config).unwrap();
        assert_eq!(stream.classes(), &["healthy", "lesion"]);

        let pairs: Vec<TrainingPair> = stream.take(5).map(Result::unwrap).collect();
        let mut per_class = [0usize; 2];
        for pair in &pairs {
            let label = &pair.outputs[0];
            assert_eq!(label.shape(), &[1, 2]);
            let class = if label[[0, 1]] == 1.0 { 1 } else { 0 };
            assert_eq!(label[[0, 1 - class]], 0.0);
            assert_eq!(pair.inputs[0].shape(), &[1, 2, 2, 1]);
            assert_eq!(pair.inputs[0][[0, 0, 0, 0]], class as f32);
            per_class[class] += 1;
        }
        assert_eq!(per_class, [2, 3]);
    }

    #[test]
    fn test_no_class_folders() {
        let dir = tempdir().unwrap();
        assert!(CategoryStream::open(dir.path(), VolumeStreamConfig::default()).is_err());
    }
}
