//! Patch extraction and batching over one in-memory volume.
//!
//! A [`PatchStream`] walks a [`PatchGrid`], extracts each sub-array, applies
//! the optional axis collapse and [`LabelEncoding`], then stacks samples into
//! batches. In fixed mode the batch size is part of the configuration; in
//! negotiated mode the consumer announces each batch size through
//! [`PatchStream::open`] and [`PatchStream::request_next`].

use super::grid::{PatchGrid, PatchSpec};
use crate::error::{Error, Result};
use crate::transforms::{collapse_axis, LabelEncoding};
use crate::volume::{stack_samples, Batch, Volume};
use ndarray::{ArrayD, Slice};

/// Options for a [`PatchStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchStreamConfig {
    /// Patch shape and stride, same rank as the volume.
    pub patch: PatchSpec,
    /// Samples per batch in fixed mode; initial hint in negotiated mode.
    pub batch_size: usize,
    /// Restart the grid instead of ending after the last patch.
    pub infinite: bool,
    /// Per-patch encoding.
    pub encoding: LabelEncoding,
    /// Axis of the patch to squeeze before encoding.
    pub collapse_axis: Option<usize>,
}

impl PatchStreamConfig {
    /// Finite, batch size 1, no encoding.
    pub fn new(patch: PatchSpec) -> Self {
        Self {
            patch,
            batch_size: 1,
            infinite: false,
            encoding: LabelEncoding::None,
            collapse_axis: None,
        }
    }

    /// Set the batch size.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Restart the grid when it is exhausted.
    #[must_use]
    pub fn infinite(mut self, infinite: bool) -> Self {
        self.infinite = infinite;
        self
    }

    /// Set the per-patch encoding.
    #[must_use]
    pub fn encoding(mut self, encoding: LabelEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Squeeze `axis` from every patch.
    #[must_use]
    pub fn collapse_axis(mut self, axis: Option<usize>) -> Self {
        self.collapse_axis = axis;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Fixed,
    Negotiated { opened: bool },
}

/// Lazy sequence of patch batches from one volume.
#[derive(Debug)]
pub struct PatchStream {
    source: String,
    volume: Volume,
    grid: PatchGrid,
    config: PatchStreamConfig,
    mode: Mode,
    batch_size: usize,
    cursor: usize,
    finished: bool,
}

impl PatchStream {
    /// Fixed-size batching.
    pub fn new(volume: Volume, config: PatchStreamConfig) -> Result<Self> {
        Self::build("volume", volume, config, Mode::Fixed)
    }

    /// Fixed-size batching; `source` names the volume in errors.
    pub fn named(
        source: impl Into<String>,
        volume: Volume,
        config: PatchStreamConfig,
    ) -> Result<Self> {
        Self::build(source, volume, config, Mode::Fixed)
    }

    /// Consumer-driven batching. Call [`open`](Self::open) before pulling.
    pub fn negotiated(volume: Volume, config: PatchStreamConfig) -> Result<Self> {
        Self::build("volume", volume, config, Mode::Negotiated { opened: false })
    }

    /// Consumer-driven batching; `source` names the volume in errors.
    pub fn negotiated_named(
        source: impl Into<String>,
        volume: Volume,
        config: PatchStreamConfig,
    ) -> Result<Self> {
        Self::build(source, volume, config, Mode::Negotiated { opened: false })
    }

    fn build(
        source: impl Into<String>,
        volume: Volume,
        config: PatchStreamConfig,
        mode: Mode,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        let source = source.into();
        let grid = PatchGrid::for_spec(volume.shape(), &config.patch)?;
        grid.ensure_non_empty(&source)?;
        if let Some(axis) = config.collapse_axis {
            if axis >= volume.ndim() {
                return Err(Error::config(format!(
                    "collapse axis {} out of range for a {}-dimensional volume",
                    axis,
                    volume.ndim()
                )));
            }
        }
        Ok(Self {
            source,
            batch_size: config.batch_size,
            volume,
            grid,
            config,
            mode,
            cursor: 0,
            finished: false,
        })
    }

    /// Handshake for negotiated mode: set the first batch size.
    pub fn open(&mut self, initial_size: usize) -> Result<()> {
        match self.mode {
            Mode::Fixed => Err(Error::Protocol(format!(
                "open called on fixed-size patch stream over {}",
                self.source
            ))),
            Mode::Negotiated { opened: true } => Err(Error::Protocol(format!(
                "patch stream over {} is already open",
                self.source
            ))),
            Mode::Negotiated { opened: false } => {
                if initial_size == 0 {
                    return Err(Error::Protocol("initial batch size must be at least 1".into()));
                }
                self.batch_size = initial_size;
                self.mode = Mode::Negotiated { opened: true };
                Ok(())
            }
        }
    }

    /// Yield a batch of `size` samples (fewer only for the trailing batch of
    /// a finite stream). Subsequent [`next`](Iterator::next) calls reuse `size`.
    pub fn request_next(&mut self, size: usize) -> Result<Batch> {
        match self.mode {
            Mode::Fixed => {
                return Err(Error::Protocol(format!(
                    "request_next called on fixed-size patch stream over {}",
                    self.source
                )))
            }
            Mode::Negotiated { opened: false } => {
                return Err(Error::Protocol(format!(
                    "request_next before open on patch stream over {}",
                    self.source
                )))
            }
            Mode::Negotiated { opened: true } => {}
        }
        if size == 0 {
            return Err(Error::Protocol("requested batch size must be at least 1".into()));
        }
        self.batch_size = size;
        self.fill(size)?
            .ok_or_else(|| Error::Exhausted(format!("patch stream over {}", self.source)))
    }

    /// The grid being walked.
    pub fn grid(&self) -> &PatchGrid {
        &self.grid
    }

    /// Patches not yet extracted in the current pass.
    pub fn remaining(&self) -> usize {
        self.grid.len() - self.cursor
    }

    /// Current batch size (configured or last negotiated).
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Name used in errors.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Extract and encode patch `index`.
    fn extract(&self, index: usize) -> Result<ArrayD<f32>> {
        let offset = self.grid.offset(index).ok_or_else(|| {
            Error::InvalidDimensions(format!(
                "patch index {} outside grid of {}",
                index,
                self.grid.len()
            ))
        })?;
        let shape = self.grid.patch_shape();
        let patch = self
            .volume
            .slice_each_axis(|ax| {
                let i = ax.axis.index();
                Slice::from(offset[i]..offset[i] + shape[i])
            })
            .to_owned();
        let patch = match self.config.collapse_axis {
            Some(axis) => collapse_axis(patch, axis, &self.source)?,
            None => patch,
        };
        self.config.encoding.apply(patch, &self.source)
    }

    /// Accumulate up to `size` samples. `Ok(None)` once a finite stream ended.
    fn fill(&mut self, size: usize) -> Result<Option<Batch>> {
        if self.finished {
            return Ok(None);
        }
        let mut samples = Vec::with_capacity(size);
        while samples.len() < size {
            if self.cursor == self.grid.len() {
                if self.config.infinite {
                    self.cursor = 0;
                } else {
                    self.finished = true;
                    break;
                }
            }
            match self.extract(self.cursor) {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            }
            self.cursor += 1;
        }
        if samples.is_empty() {
            return Ok(None);
        }
        stack_samples(&samples).map(Some)
    }
}

impl Iterator for PatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.mode == (Mode::Negotiated { opened: false }) {
            return Some(Err(Error::Protocol(format!(
                "patch stream over {} pulled before open",
                self.source
            ))));
        }
        self.fill(self.batch_size).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::realized_size;
    use ndarray::IxDyn;

    fn ramp(shape: &[usize]) -> Volume {
        let n: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|i| i as f32).collect()).unwrap()
    }

    fn sizes(stream: PatchStream) -> Vec<usize> {
        stream.map(|b| realized_size(&b.unwrap())).collect()
    }

    #[test]
    fn test_finite_batch_completeness() {
        // 3 x 3 x 2 = 18 patches
        let config = PatchStreamConfig::new(PatchSpec::new(vec![2, 2, 2])).batch_size(4);
        let stream = PatchStream::new(ramp(&[4, 4, 3]), config).unwrap();
        assert_eq!(stream.grid().len(), 18);
        assert_eq!(sizes(stream), vec![4, 4, 4, 4, 2]);

        let config = PatchStreamConfig::new(PatchSpec::tiled(vec![2, 2])).batch_size(2);
        let stream = PatchStream::new(ramp(&[4, 4]), config).unwrap();
        assert_eq!(sizes(stream), vec![2, 2]);
    }

    #[test]
    fn test_patch_contents_follow_grid_order() {
        let volume = ramp(&[2, 4]);
        let config = PatchStreamConfig::new(PatchSpec::tiled(vec![2, 2])).batch_size(1);
        let batches: Vec<Batch> = PatchStream::new(volume, config)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].shape(), &[1, 2, 2]);
        assert_eq!(batches[0].iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 4.0, 5.0]);
        assert_eq!(batches[1].iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn test_infinite_carries_partial_batch() {
        // 4 patches, batch 3: second batch wraps around to offset 0.
        let config = PatchStreamConfig::new(PatchSpec::tiled(vec![1, 2]))
            .batch_size(3)
            .infinite(true);
        let mut stream = PatchStream::new(ramp(&[4, 2]), config).unwrap();
        let first = stream.next().unwrap().unwrap();
        let second = stream.next().unwrap().unwrap();
        assert_eq!(realized_size(&first), 3);
        assert_eq!(realized_size(&second), 3);
        assert_eq!(second[[0, 0, 0]], 6.0);
        assert_eq!(second[[1, 0, 0]], 0.0);
        assert_eq!(second[[2, 0, 0]], 2.0);
    }

    #[test]
    fn test_empty_grid_rejected() {
        let config = PatchStreamConfig::new(PatchSpec::new(vec![5, 2]));
        assert!(matches!(
            PatchStream::new(ramp(&[4, 4]), config),
            Err(Error::EmptyPatchGrid { .. })
        ));
    }

    #[test]
    fn test_negotiated_tracks_requested_sizes() {
        let config = PatchStreamConfig::new(PatchSpec::tiled(vec![2, 2])).infinite(true);
        let mut stream = PatchStream::negotiated(ramp(&[4, 4]), config).unwrap();
        stream.open(4).unwrap();
        for size in [4, 1, 4, 3] {
            let batch = stream.request_next(size).unwrap();
            assert_eq!(realized_size(&batch), size);
        }
        let batch = stream.next().unwrap().unwrap();
        assert_eq!(realized_size(&batch), 3);
    }

    #[test]
    fn test_negotiated_protocol_errors() {
        let config = PatchStreamConfig::new(PatchSpec::tiled(vec![2, 2])).infinite(true);
        let mut stream = PatchStream::negotiated(ramp(&[4, 4]), config.clone()).unwrap();
        assert!(matches!(stream.request_next(2), Err(Error::Protocol(_))));
        assert!(matches!(stream.next(), Some(Err(Error::Protocol(_)))));
        assert!(matches!(stream.open(0), Err(Error::Protocol(_))));
        stream.open(2).unwrap();
        assert!(matches!(stream.open(2), Err(Error::Protocol(_))));
        assert!(matches!(stream.request_next(0), Err(Error::Protocol(_))));

        let mut fixed = PatchStream::new(ramp(&[4, 4]), config).unwrap();
        assert!(matches!(fixed.open(2), Err(Error::Protocol(_))));
        assert!(matches!(fixed.request_next(2), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_negotiated_finite_exhausts() {
        let config = PatchStreamConfig::new(PatchSpec::tiled(vec![2, 2]));
        let mut stream = PatchStream::negotiated(ramp(&[4, 4]), config).unwrap();
        stream.open(3).unwrap();
        assert_eq!(realized_size(&stream.request_next(3).unwrap()), 3);
        assert_eq!(realized_size(&stream.request_next(3).unwrap()), 1);
        assert!(matches!(stream.request_next(3), Err(Error::Exhausted(_))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_collapse_and_encoding() {
        let volume = ArrayD::from_shape_fn(IxDyn(&[4, 1, 4]), |ix| ((ix[0] + ix[2]) % 3) as f32);
        let config = PatchStreamConfig::new(PatchSpec::tiled(vec![2, 1, 2]))
            .batch_size(2)
            .collapse_axis(Some(1))
            .encoding(LabelEncoding::Categorical {
                nb_labels: 3,
                keep_shape: true,
            });
        let batch = PatchStream::new(volume, config).unwrap().next().unwrap().unwrap();
        assert_eq!(batch.shape(), &[2, 2, 2, 3]);
        assert_eq!(batch.sum(), 8.0);
    }

    #[test]
    fn test_collapse_of_long_axis_is_integrity_error() {
        let config = PatchStreamConfig::new(PatchSpec::new(vec![2, 2])).collapse_axis(Some(0));
        let mut stream = PatchStream::named("subj.npz", ramp(&[2, 2]), config).unwrap();
        match stream.next() {
            Some(Err(Error::DataIntegrity { file, .. })) => assert_eq!(file, "subj.npz"),
            other => panic!("expected integrity error, got {:?}", other),
        }
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = PatchStreamConfig::new(PatchSpec::new(vec![2, 2])).batch_size(0);
        assert!(matches!(
            PatchStream::new(ramp(&[2, 2]), config),
            Err(Error::Configuration(_))
        ));
    }
}
