//! Error types for medfeed.
//!
//! Fatal conditions (configuration mistakes, empty grids, corrupt data,
//! protocol misuse) are all variants of [`Error`]. The one advisory condition,
//! a file-list mismatch between paired directories, is only an error when the
//! stream was configured with [`MismatchPolicy::Fail`](crate::pipeline::MismatchPolicy).

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by medfeed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid option values or inconsistent options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No file in a directory matched the requested extension.
    #[error("no files with extension '{extension}' found in {}", .directory.display())]
    EmptyDirectory {
        /// Directory that was listed.
        directory: PathBuf,
        /// Extension filter.
        extension: String,
    },

    /// The patch grid over a volume contains no patch.
    #[error("empty patch grid for {source_name}: volume shape {volume_shape:?}, patch shape {patch_shape:?}")]
    EmptyPatchGrid {
        /// File (or stream) the volume came from.
        source_name: String,
        /// Shape of the volume.
        volume_shape: Vec<usize>,
        /// Requested patch shape.
        patch_shape: Vec<usize>,
    },

    /// Loaded data violates an invariant (non-finite values, bad labels, bad shapes).
    #[error("data integrity error in {file}: {reason}")]
    DataIntegrity {
        /// Offending file (or stream name for in-memory data).
        file: String,
        /// What was wrong.
        reason: String,
    },

    /// File extension has no known loader.
    #[error("unsupported volume format: '{0}'")]
    UnsupportedFormat(String),

    /// Negotiated batching used out of order.
    #[error("negotiation protocol error: {0}")]
    Protocol(String),

    /// Paired directories do not list corresponding files.
    #[error("file lists did not match for {stream}: {detail}")]
    FileListMismatch {
        /// Stream name.
        stream: String,
        /// First differing entry or length difference.
        detail: String,
    },

    /// A finite stream has no more batches.
    #[error("stream exhausted: {0}")]
    Exhausted(String),

    /// Header magic bytes are not recognised.
    #[error("invalid NIfTI magic: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unknown on-disk element type code.
    #[error("unsupported data type code {0}")]
    UnsupportedDataType(i16),

    /// Header dimensions are malformed or do not match the payload.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// gzip stream could not be decoded.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// `.npz` member lookup or element type failure.
    #[error("numpy array error: {0}")]
    Npy(String),

    /// `.npy` payload could not be decoded.
    #[error("cannot read .npy: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// `.npz` archive could not be read.
    #[error("cannot read .npz: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    /// `.npy` payload could not be written.
    #[error("cannot write .npy: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    /// `.npz` archive could not be written.
    #[error("cannot write .npz: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    /// 2D image decoding failure.
    #[error("image decoding error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON configuration could not be parsed (including unknown keys).
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a [`Error::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for a [`Error::DataIntegrity`].
    pub fn integrity(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error stems from configuration rather than data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::EmptyPatchGrid { .. } | Self::Json(_)
        )
    }
}
