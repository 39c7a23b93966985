//! NumPy `.npy` arrays and `.npz` archives.
//!
//! Arrays of any numeric element type are accepted and converted to `f32`.
//! `.npz` volumes are looked up by key (`vol_data` for pipeline volumes,
//! `prior` for precomputed priors).

use crate::error::{Error, Result};
use crate::volume::Volume;
use ndarray::ArrayD;
use ndarray_npy::{NpzReader, NpzWriter, ReadNpyExt, WriteNpyExt};
use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;

/// Decode a `.npy` byte buffer of any supported element type.
fn decode_npy(bytes: &[u8]) -> Result<Volume> {
    macro_rules! try_types {
        ($($t:ty),+) => {
            $(
                if let Ok(array) = ArrayD::<$t>::read_npy(Cursor::new(bytes)) {
                    return Ok(array.mapv(|v| v as f32).as_standard_layout().into_owned());
                }
            )+
        };
    }
    try_types!(f32, f64, i64, i32, i16, i8, u8, u16, u32, u64);

    let array = ArrayD::<f32>::read_npy(Cursor::new(bytes))?;
    Ok(array.as_standard_layout().into_owned())
}

/// Load a `.npy` file.
pub fn load_npy<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let bytes = std::fs::read(path)?;
    decode_npy(&bytes)
}

/// Load the array stored under `key` in a `.npz` archive.
pub fn load_npz<P: AsRef<Path>>(path: P, key: &str) -> Result<Volume> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let mut reader = NpzReader::new(Cursor::new(bytes))?;
    let names = reader.names()?;

    let wanted = format!("{key}.npy");
    let name = names
        .iter()
        .find(|n| n.as_str() == key || n.as_str() == wanted)
        .cloned()
        .ok_or_else(|| {
            Error::Npy(format!(
                "{}: no array named '{}' (found {:?})",
                path.display(),
                key,
                names
            ))
        })?;

    macro_rules! try_types {
        ($($t:ty),+) => {
            $(
                if let Ok(array) = reader.by_name::<ndarray::OwnedRepr<$t>, ndarray::IxDyn>(&name) {
                    return Ok(array.mapv(|v| v as f32).as_standard_layout().into_owned());
                }
            )+
        };
    }
    try_types!(f32, f64, i64, i32, i16, i8, u8, u16, u32, u64);

    Err(Error::Npy(format!(
        "{}: array '{}' has an unsupported element type",
        path.display(),
        key
    )))
}

/// Write a volume as `.npy`.
pub fn save_npy<P: AsRef<Path>>(volume: &Volume, path: P) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    volume.write_npy(writer)?;
    Ok(())
}

/// Write a volume into a single-array `.npz` archive under `key`.
pub fn save_npz<P: AsRef<Path>>(volume: &Volume, path: P, key: &str) -> Result<()> {
    let mut npz = NpzWriter::new(File::create(path)?);
    npz.add_array(key, volume)?;
    npz.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, IxDyn};
    use tempfile::tempdir;

    #[test]
    fn test_npy_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol.npy");
        let volume =
            ArrayD::from_shape_fn(IxDyn(&[3, 4, 2]), |ix| (ix[0] * 8 + ix[1] * 2 + ix[2]) as f32);
        save_npy(&volume, &path).unwrap();
        assert_eq!(load_npy(&path).unwrap(), volume);
    }

    #[test]
    fn test_npy_integer_labels_converted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.npy");
        let labels = Array3::<u8>::from_shape_fn((2, 2, 2), |(i, j, k)| (i + j + k) as u8 * 3);
        ndarray_npy::write_npy(&path, &labels).unwrap();

        let loaded = load_npy(&path).unwrap();
        assert_eq!(loaded.shape(), &[2, 2, 2]);
        assert_eq!(loaded[[1, 1, 1]], 9.0);
    }

    #[test]
    fn test_npz_by_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subj_norm.npz");
        let volume = ArrayD::from_elem(IxDyn(&[2, 3, 4]), 1.5f32);
        save_npz(&volume, &path, "vol_data").unwrap();

        assert_eq!(load_npz(&path, "vol_data").unwrap(), volume);
        let err = load_npz(&path, "prior").unwrap_err();
        assert!(err.to_string().contains("prior"));
    }

    #[test]
    fn test_garbage_npy_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.npy");
        std::fs::write(&path, b"not an array").unwrap();
        assert!(matches!(load_npy(&path), Err(Error::ReadNpy(_))));
    }
}
