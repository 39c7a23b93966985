//! Volume loading and directory listing.
//!
//! The pipelines only depend on the [`VolumeLoader`] trait; [`FileLoader`] is
//! the default implementation dispatching on [`VolumeFormat`].

pub mod image;
pub mod mgz;
pub mod nifti;
pub mod npy;

use crate::error::{Error, Result};
use crate::volume::Volume;
use std::path::Path;
use std::time::Instant;

/// Container formats understood by [`FileLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    /// NumPy archive, volume stored under a key.
    Npz,
    /// Raw NumPy array.
    Npy,
    /// Uncompressed NIfTI.
    Nifti,
    /// gzipped NIfTI.
    NiftiGz,
    /// FreeSurfer MGH, plain or gzipped.
    Mgz,
    /// 8-bit PNG image (first channel).
    Png,
}

impl VolumeFormat {
    /// Select a format from a file extension filter such as `".nii.gz"` or `"npy"`.
    pub fn from_extension(ext: &str) -> Result<Self> {
        let normalized = ext.trim_start_matches('.').to_ascii_lowercase();
        match normalized.as_str() {
            "npz" => Ok(Self::Npz),
            "npy" => Ok(Self::Npy),
            "nii" => Ok(Self::Nifti),
            "nii.gz" => Ok(Self::NiftiGz),
            "mgz" | "mgh" => Ok(Self::Mgz),
            "png" => Ok(Self::Png),
            _ => Err(Error::UnsupportedFormat(ext.to_string())),
        }
    }

    /// Infer the format from a file name.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::UnsupportedFormat(path.display().to_string()))?
            .to_ascii_lowercase();
        if name.ends_with(".nii.gz") {
            return Ok(Self::NiftiGz);
        }
        match name.rsplit_once('.') {
            Some((_, ext)) => Self::from_extension(ext),
            None => Err(Error::UnsupportedFormat(name)),
        }
    }
}

/// Source of volumes for the streaming pipelines.
pub trait VolumeLoader {
    /// Load the volume stored at `path`.
    fn load(&self, path: &Path) -> Result<Volume>;
}

impl<F> VolumeLoader for F
where
    F: Fn(&Path) -> Result<Volume>,
{
    fn load(&self, path: &Path) -> Result<Volume> {
        self(path)
    }
}

/// Default loader reading one container format from disk.
#[derive(Debug, Clone)]
pub struct FileLoader {
    format: VolumeFormat,
    npz_key: String,
    verbose: bool,
}

impl FileLoader {
    /// Loader for `format`, reading `.npz` arrays under `vol_data`.
    pub fn new(format: VolumeFormat) -> Self {
        Self {
            format,
            npz_key: "vol_data".to_string(),
            verbose: false,
        }
    }

    /// Loader for the format implied by an extension filter.
    pub fn for_extension(ext: &str) -> Result<Self> {
        Ok(Self::new(VolumeFormat::from_extension(ext)?))
    }

    /// Key of the array inside `.npz` archives.
    pub fn npz_key(mut self, key: impl Into<String>) -> Self {
        self.npz_key = key.into();
        self
    }

    /// Log load timings at info level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Configured format.
    pub fn format(&self) -> VolumeFormat {
        self.format
    }
}

impl VolumeLoader for FileLoader {
    fn load(&self, path: &Path) -> Result<Volume> {
        let started = Instant::now();
        let volume = match self.format {
            VolumeFormat::Npz => npy::load_npz(path, &self.npz_key)?,
            VolumeFormat::Npy => npy::load_npy(path)?,
            VolumeFormat::Nifti | VolumeFormat::NiftiGz => nifti::load(path)?,
            VolumeFormat::Mgz => mgz::load(path)?,
            VolumeFormat::Png => image::load_channel(path, 0)?,
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if self.verbose {
            tracing::info!(
                file = %path.display(),
                shape = ?volume.shape(),
                elapsed_ms,
                "loaded volume"
            );
        } else {
            tracing::debug!(
                file = %path.display(),
                shape = ?volume.shape(),
                elapsed_ms,
                "loaded volume"
            );
        }
        Ok(volume)
    }
}

/// Sorted names of the regular files in `directory` ending with `extension`.
pub fn list_files<P: AsRef<Path>>(directory: P, extension: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(directory.as_ref())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(extension) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Sorted names of the sub-directories of `directory`.
pub fn list_subdirectories<P: AsRef<Path>>(directory: P) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(directory.as_ref())? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use tempfile::tempdir;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(VolumeFormat::from_extension(".npz").unwrap(), VolumeFormat::Npz);
        assert_eq!(VolumeFormat::from_extension("npy").unwrap(), VolumeFormat::Npy);
        assert_eq!(
            VolumeFormat::from_extension(".nii.gz").unwrap(),
            VolumeFormat::NiftiGz
        );
        assert_eq!(VolumeFormat::from_extension(".MGZ").unwrap(), VolumeFormat::Mgz);
        assert!(matches!(
            VolumeFormat::from_extension(".dcm"),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            VolumeFormat::from_path(Path::new("/a/b/subj_norm.nii.gz")).unwrap(),
            VolumeFormat::NiftiGz
        );
        assert_eq!(
            VolumeFormat::from_path(Path::new("prior.npz")).unwrap(),
            VolumeFormat::Npz
        );
        assert!(VolumeFormat::from_path(Path::new("README")).is_err());
    }

    #[test]
    fn test_list_files_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        for name in ["c.npz", "a.npz", "b.npy", "d.npz.bak"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.npz")).unwrap();

        let files = list_files(dir.path(), ".npz").unwrap();
        assert_eq!(files, vec!["a.npz", "c.npz"]);
        assert_eq!(list_subdirectories(dir.path()).unwrap(), vec!["sub.npz"]);
    }

    #[test]
    fn test_file_loader_dispatch() {
        let dir = tempdir().unwrap();
        let volume = ArrayD::from_elem(IxDyn(&[2, 2, 2]), 3.0f32);

        let npy_path = dir.path().join("v.npy");
        npy::save_npy(&volume, &npy_path).unwrap();
        let nii_path = dir.path().join("v.nii.gz");
        nifti::save(&volume, &nii_path).unwrap();
        let npz_path = dir.path().join("v.npz");
        npy::save_npz(&volume, &npz_path, "prior").unwrap();

        let loader = FileLoader::for_extension(".npy").unwrap();
        assert_eq!(loader.load(&npy_path).unwrap(), volume);
        let loader = FileLoader::for_extension(".nii.gz").unwrap();
        assert_eq!(loader.load(&nii_path).unwrap(), volume);
        let loader = FileLoader::new(VolumeFormat::Npz).npz_key("prior");
        assert_eq!(loader.load(&npz_path).unwrap(), volume);
    }

    #[test]
    fn test_closure_loader() {
        let loader = |_: &Path| -> Result<Volume> { Ok(ArrayD::zeros(IxDyn(&[1]))) };
        assert_eq!(loader.load(Path::new("anything")).unwrap().len(), 1);
    }
}
