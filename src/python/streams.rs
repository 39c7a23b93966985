//! Stream iterators for Python.
//!
//! Each class is configured with the JSON form of the matching Rust config
//! and iterates forever; errors are raised as Python exceptions and end the
//! stream.

use pyo3::prelude::*;
use pyo3::types::PyTuple;

use super::conversion::{batch_to_numpy, pair_to_tuple, training_pair_to_tuple};
use super::validation::{to_py_err, validate_directory};
use crate::pipeline::{
    PairedStream as RustPairedStream, PairedStreamConfig, PriorConfig,
    PriorCoupler as RustPriorCoupler, VolumeStream as RustVolumeStream, VolumeStreamConfig,
};
use numpy::PyArrayDyn;

/// Infinite batch stream over a directory of volumes.
///
/// Example:
///     ```python
///     stream = medfeed.VolumeStream(
///         "vols", '{"batch_size": 4, "patch": {"shape": [32, 32, 32]}}'
///     )
///     batch = next(stream)
///     ```
#[pyclass(name = "VolumeStream", unsendable)]
pub struct PyVolumeStream {
    inner: RustVolumeStream,
}

#[pymethods]
impl PyVolumeStream {
    #[new]
    #[pyo3(signature = (directory, config=None))]
    fn new(directory: &str, config: Option<&str>) -> PyResult<Self> {
        let directory = validate_directory(directory, "VolumeStream")?;
        let config = match config {
            Some(json) => {
                VolumeStreamConfig::from_json(json).map_err(|e| to_py_err(e, "VolumeStream"))?
            }
            None => VolumeStreamConfig::default(),
        };
        let inner = RustVolumeStream::open(directory, config)
            .map_err(|e| to_py_err(e, "VolumeStream"))?;
        Ok(Self { inner })
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__<'py>(&mut self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyArrayDyn<f32>>>> {
        match self.inner.next() {
            Some(Ok(batch)) => Ok(Some(batch_to_numpy(py, batch))),
            Some(Err(e)) => Err(to_py_err(e, "VolumeStream")),
            None => Ok(None),
        }
    }

    /// Ordered file names.
    #[getter]
    fn files(&self) -> Vec<String> {
        self.inner.files().to_vec()
    }

    /// Files per cycle.
    #[getter]
    fn cycle_length(&self) -> usize {
        self.inner.cycle_length()
    }

    /// Samples per batch.
    #[getter]
    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    /// Patches in the first volume.
    #[getter]
    fn patches_per_volume(&self) -> usize {
        self.inner.patches_per_volume()
    }
}

fn open_paired(
    input_dir: &str,
    target_dir: &str,
    config: Option<&str>,
) -> PyResult<RustPairedStream> {
    let input_dir = validate_directory(input_dir, "PairedStream")?;
    let target_dir = validate_directory(target_dir, "PairedStream")?;
    let config = match config {
        Some(json) => {
            PairedStreamConfig::from_json(json).map_err(|e| to_py_err(e, "PairedStream"))?
        }
        None => PairedStreamConfig::default(),
    };
    RustPairedStream::open(input_dir, target_dir, config).map_err(|e| to_py_err(e, "PairedStream"))
}

/// `(input, target)` batches from a volume and a segmentation directory.
#[pyclass(name = "PairedStream", unsendable)]
pub struct PyPairedStream {
    inner: RustPairedStream,
}

#[pymethods]
impl PyPairedStream {
    #[new]
    #[pyo3(signature = (input_dir, target_dir, config=None))]
    fn new(input_dir: &str, target_dir: &str, config: Option<&str>) -> PyResult<Self> {
        Ok(Self {
            inner: open_paired(input_dir, target_dir, config)?,
        })
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__<'py>(&mut self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyTuple>>> {
        match self.inner.next() {
            Some(Ok((input, target))) => pair_to_tuple(py, input, target).map(Some),
            Some(Err(e)) => Err(to_py_err(e, "PairedStream")),
            None => Ok(None),
        }
    }

    /// Samples per batch.
    #[getter]
    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    /// Files per cycle.
    #[getter]
    fn cycle_length(&self) -> usize {
        self.inner.cycle_length()
    }
}

/// Paired batches with a prior attached; yields `([inputs], [outputs])`.
#[pyclass(name = "PriorCoupler", unsendable)]
pub struct PyPriorCoupler {
    inner: RustPriorCoupler,
}

#[pymethods]
impl PyPriorCoupler {
    #[new]
    #[pyo3(signature = (input_dir, target_dir, config=None, prior=None))]
    fn new(
        input_dir: &str,
        target_dir: &str,
        config: Option<&str>,
        prior: Option<&str>,
    ) -> PyResult<Self> {
        let paired = open_paired(input_dir, target_dir, config)?;
        let prior = match prior {
            Some(json) => PriorConfig::from_json(json).map_err(|e| to_py_err(e, "PriorCoupler"))?,
            None => PriorConfig::default(),
        };
        let inner =
            RustPriorCoupler::open(paired, prior).map_err(|e| to_py_err(e, "PriorCoupler"))?;
        Ok(Self { inner })
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__<'py>(&mut self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyTuple>>> {
        match self.inner.next() {
            Some(Ok(pair)) => training_pair_to_tuple(py, pair).map(Some),
            Some(Err(e)) => Err(to_py_err(e, "PriorCoupler")),
            None => Ok(None),
        }
    }

    /// Patches in the prior grid.
    #[getter]
    fn prior_patches(&self) -> usize {
        self.inner.prior_patches()
    }
}
