//! 2D `(image, segmentation)` batches from directories of PNG files.

use crate::error::{Error, Result};
use crate::io::image::load_channel;
use crate::pipeline::file_cycle::FileCycle;
use crate::pipeline::TrainingPair;
use crate::transforms::{add_channel, LabelEncoding};
use crate::volume::stack_samples;
use serde::{Deserialize, Serialize};
use std::path::Path;

const SEG_CLASSES: usize = 2;

/// Options for an [`ImageSegStream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSegConfig {
    /// File-name suffix.
    pub extension: String,
    /// Samples per batch.
    pub batch_size: usize,
    /// Image files per cycle; `None` means the file count.
    pub restart_cycle_length: Option<usize>,
    /// Seed for both file permutations.
    pub seed: Option<u64>,
}

impl Default for ImageSegConfig {
    fn default() -> Self {
        Self {
            extension: ".png".to_string(),
            batch_size: 1,
            restart_cycle_length: None,
            seed: None,
        }
    }
}

/// Infinite stream of image batches `[B, H, W, 1]` scaled to `[0, 1]` and
/// binary one-hot segmentations `[B, H, W, 2]`.
#[derive(Debug)]
pub struct ImageSegStream {
    batch_size: usize,
    images: FileCycle,
    segs: FileCycle,
    failed: bool,
}

impl ImageSegStream {
    /// Open over an image directory and a segmentation directory.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        image_dir: P,
        seg_dir: Q,
        config: ImageSegConfig,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        let images = FileCycle::create(image_dir, &config.extension, config.seed)?;
        let length = config.restart_cycle_length.unwrap_or(images.file_count());
        let images = images.with_cycle_length(length)?;
        let segs = FileCycle::create(seg_dir, &config.extension, config.seed)?;
        Ok(Self {
            batch_size: config.batch_size,
            images,
            segs,
            failed: false,
        })
    }

    fn next_pair(&mut self) -> Result<TrainingPair> {
        let encoding = LabelEncoding::Categorical {
            nb_labels: SEG_CLASSES,
            keep_shape: true,
        };
        let mut images = Vec::with_capacity(self.batch_size);
        let mut segs = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let step = self.images.advance();
            images.push(add_channel(load_channel(&step.path, 0)? / 255.0));
            let step = self.segs.advance();
            segs.push(encoding.apply(load_channel(&step.path, 0)?, &step.file)?);
        }
        Ok(TrainingPair::new(stack_samples(&images)?, stack_samples(&segs)?))
    }
}

impl Iterator for ImageSegStream {
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
