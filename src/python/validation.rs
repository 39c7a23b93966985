//! Error mapping and argument checks at the Python boundary.

use crate::error::Error as MedfeedError;
use pyo3::exceptions::{PyFileNotFoundError, PyIOError, PyStopIteration, PyValueError};

/// Convert a medfeed error to the matching Python exception.
pub fn to_py_err(e: MedfeedError, context: &str) -> pyo3::PyErr {
    match &e {
        MedfeedError::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
            PyFileNotFoundError::new_err(format!("{}: {}", context, io_err))
        }
        MedfeedError::Io(io_err) => PyIOError::new_err(format!("{}: {}", context, io_err)),
        MedfeedError::Exhausted(msg) => PyStopIteration::new_err(format!("{}: {}", context, msg)),
        MedfeedError::Decompression(_)
        | MedfeedError::InvalidMagic(_)
        | MedfeedError::UnsupportedDataType(_)
        | MedfeedError::InvalidDimensions(_)
        | MedfeedError::Npy(_)
        | MedfeedError::ReadNpy(_)
        | MedfeedError::ReadNpz(_)
        | MedfeedError::WriteNpy(_)
        | MedfeedError::WriteNpz(_)
        | MedfeedError::Image(_) => PyIOError::new_err(format!("{}: {}", context, e)),
        MedfeedError::Configuration(_)
        | MedfeedError::EmptyDirectory { .. }
        | MedfeedError::EmptyPatchGrid { .. }
        | MedfeedError::DataIntegrity { .. }
        | MedfeedError::UnsupportedFormat(_)
        | MedfeedError::Protocol(_)
        | MedfeedError::FileListMismatch { .. }
        | MedfeedError::Json(_) => PyValueError::new_err(format!("{}: {}", context, e)),
    }
}

/// Reject directory arguments that are empty or do not exist.
pub fn validate_directory(path: &str, operation: &str) -> pyo3::PyResult<std::path::PathBuf> {
    if path.is_empty() {
        return Err(PyValueError::new_err(format!(
            "{}: directory cannot be empty",
            operation
        )));
    }
    if path.contains('\0') {
        return Err(PyValueError::new_err(format!(
            "{}: directory cannot contain null bytes",
            operation
        )));
    }
    let path_buf = std::path::PathBuf::from(path);
    if !path_buf.is_dir() {
        return Err(PyFileNotFoundError::new_err(format!(
            "{}: directory not found: {}",
            operation, path
        )));
    }
    Ok(path_buf)
}
