//! Moving batches into numpy.

use crate::pipeline::TrainingPair;
use crate::volume::Batch;
use numpy::{IntoPyArray, PyArrayDyn};
use pyo3::prelude::*;
use pyo3::types::{PyList, PyTuple};

/// Move a batch into a numpy array without copying.
pub fn batch_to_numpy(py: Python<'_>, batch: Batch) -> Bound<'_, PyArrayDyn<f32>> {
    batch.into_pyarray(py)
}

/// `(input, target)` as a tuple of arrays.
pub fn pair_to_tuple(py: Python<'_>, input: Batch, target: Batch) -> PyResult<Bound<'_, PyTuple>> {
    PyTuple::new(py, [batch_to_numpy(py, input), batch_to_numpy(py, target)])
}

/// `([inputs...], [outputs...])` as a tuple of lists.
pub fn training_pair_to_tuple(py: Python<'_>, pair: TrainingPair) -> PyResult<Bound<'_, PyTuple>> {
    let inputs = PyList::new(py, pair.inputs.into_iter().map(|b| batch_to_numpy(py, b)))?;
    let outputs = PyList::new(py, pair.outputs.into_iter().map(|b| batch_to_numpy(py, b)))?;
    PyTuple::new(py, [inputs.into_any(), outputs.into_any()])
}
