//! FreeSurfer MGH / MGZ volumes.
//!
//! The format is a 284-byte big-endian header followed by voxel data with the
//! first axis fastest; `.mgz` is the same byte stream gzipped. Multi-frame
//! files become 4D volumes `[width, height, depth, frames]`.

use super::nifti::gunzip;
use crate::error::{Error, Result};
use crate::volume::Volume;
use byteorder::{BigEndian, ByteOrder};
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const HEADER_SIZE: usize = 284;
const VERSION: i32 = 1;

/// MGH element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MghType {
    /// `MRI_UCHAR`
    UChar,
    /// `MRI_INT`
    Int,
    /// `MRI_FLOAT`
    Float,
    /// `MRI_SHORT`
    Short,
}

impl MghType {
    fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::UChar),
            1 => Ok(Self::Int),
            3 => Ok(Self::Float),
            4 => Ok(Self::Short),
            other => Err(Error::UnsupportedDataType(other as i16)),
        }
    }

    const fn code(self) -> i32 {
        match self {
            Self::UChar => 0,
            Self::Int => 1,
            Self::Float => 3,
            Self::Short => 4,
        }
    }

    const fn byte_size(self) -> usize {
        match self {
            Self::UChar => 1,
            Self::Short => 2,
            Self::Int | Self::Float => 4,
        }
    }
}

/// Parsed MGH header.
#[derive(Debug, Clone, PartialEq)]
pub struct MghHeader {
    /// `[width, height, depth]` or `[width, height, depth, frames]`.
    pub dims: Vec<usize>,
    /// Element type.
    pub kind: MghType,
    /// Voxel size when the RAS block is present.
    pub spacing: Option<[f32; 3]>,
}

impl MghHeader {
    /// Parse the fixed-size header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidDimensions(format!(
                "MGH header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let version = BigEndian::read_i32(&bytes[0..4]);
        if version != VERSION {
            return Err(Error::InvalidDimensions(format!(
                "unsupported MGH version {}",
                version
            )));
        }

        let mut dims = Vec::with_capacity(4);
        for (axis, at) in [4usize, 8, 12, 16].into_iter().enumerate() {
            let raw = BigEndian::read_i32(&bytes[at..at + 4]);
            if raw < 1 {
                return Err(Error::InvalidDimensions(format!(
                    "MGH dimension {} must be positive, got {}",
                    axis, raw
                )));
            }
            dims.push(raw as usize);
        }
        if dims[3] == 1 {
            dims.pop();
        }

        let kind = MghType::from_code(BigEndian::read_i32(&bytes[20..24]))?;
        let good_ras = BigEndian::read_i16(&bytes[28..30]) > 0;
        let spacing = good_ras.then(|| {
            [
                BigEndian::read_f32(&bytes[30..34]),
                BigEndian::read_f32(&bytes[34..38]),
                BigEndian::read_f32(&bytes[38..42]),
            ]
        });

        Ok(Self {
            dims,
            kind,
            spacing,
        })
    }

    fn data_size(&self) -> usize {
        self.dims.iter().product::<usize>() * self.kind.byte_size()
    }
}

fn volume_from_bytes(bytes: &[u8]) -> Result<Volume> {
    let header = MghHeader::from_bytes(bytes)?;
    let end = HEADER_SIZE + header.data_size();
    if bytes.len() < end {
        return Err(Error::InvalidDimensions(format!(
            "MGH payload truncated: need {} bytes, got {}",
            end,
            bytes.len()
        )));
    }
    let raw = &bytes[HEADER_SIZE..end];
    let voxels: Vec<f32> = match header.kind {
        MghType::UChar => raw.iter().map(|&v| f32::from(v)).collect(),
        MghType::Short => raw
            .chunks_exact(2)
            .map(|c| f32::from(BigEndian::read_i16(c)))
            .collect(),
        MghType::Int => raw
            .chunks_exact(4)
            .map(|c| BigEndian::read_i32(c) as f32)
            .collect(),
        MghType::Float => raw.chunks_exact(4).map(BigEndian::read_f32).collect(),
    };

    let fortran = ArrayD::from_shape_vec(IxDyn(&header.dims).f(), voxels)
        .map_err(|e| Error::InvalidDimensions(format!("voxel count mismatch: {}", e)))?;
    Ok(fortran.as_standard_layout().into_owned())
}

/// Load an `.mgh` or `.mgz` file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let is_mgz = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("mgz") || e.eq_ignore_ascii_case("gz"));
    if is_mgz {
        volume_from_bytes(&gunzip(&bytes)?)
    } else {
        volume_from_bytes(&bytes)
    }
}

/// Save a 3D or 4D volume as `float` MGH, gzipped when the path ends in `.mgz`.
pub fn save<P: AsRef<Path>>(volume: &Volume, path: P) -> Result<()> {
    let path = path.as_ref();
    if !(3..=4).contains(&volume.ndim()) {
        return Err(Error::InvalidDimensions(format!(
            "MGH volumes are 3D or 4D, got {} dimensions",
            volume.ndim()
        )));
    }

    let mut bytes = vec![0u8; HEADER_SIZE + volume.len() * 4];
    BigEndian::write_i32(&mut bytes[0..4], VERSION);
    for (i, at) in [4usize, 8, 12, 16].into_iter().enumerate() {
        let dim = volume.shape().get(i).copied().unwrap_or(1);
        BigEndian::write_i32(&mut bytes[at..at + 4], dim as i32);
    }
    BigEndian::write_i32(&mut bytes[20..24], MghType::Float.code());
    BigEndian::write_i16(&mut bytes[28..30], 1);
    for at in [30usize, 34, 38] {
        BigEndian::write_f32(&mut bytes[at..at + 4], 1.0);
    }
    // Direction cosines: identity.
    for (row, at) in [42usize, 54, 66].into_iter().enumerate() {
        BigEndian::write_f32(&mut bytes[at + row * 4..at + row * 4 + 4], 1.0);
    }

    for (chunk, &v) in bytes[HEADER_SIZE..]
        .chunks_exact_mut(4)
        .zip(volume.t().iter())
    {
        BigEndian::write_f32(chunk, v);
    }

    let mut writer = BufWriter::new(File::create(path)?);
    if path.extension().and_then(|e| e.to_str()) == Some("mgz") {
        let mut encoder = GzEncoder::new(writer, Compression::fast());
        encoder.write_all(&bytes)?;
        encoder.finish()?.flush()?;
    } else {
        writer.write_all(&bytes)?;
        writer.flush()?;
    }
    Ok(())
}
