//! `NIfTI` reading and writing.
//!
//! Reads NIfTI-1 (348-byte header) and NIfTI-2 (540-byte header) files in
//! either byte order, plain (`.nii`, memory-mapped) or gzipped (`.nii.gz`,
//! multi-member aware). Voxels are converted to `f32`, scaled by
//! `scl_slope`/`scl_inter`, and returned in row-major layout with the same
//! logical axis order as the file (`[x, y, z, ...]`).
//!
//! Writing produces little-endian NIfTI-1 `float32` files with an identity
//! sform, which is what the pipelines and tests need.

use crate::error::{Error, Result};
use crate::volume::Volume;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use half::{bf16, f16};
use memmap2::Mmap;
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// NIfTI format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NiftiVersion {
    /// 348-byte header, 16-bit dimensions.
    #[default]
    Nifti1,
    /// 540-byte header, 64-bit dimensions.
    Nifti2,
}

impl NiftiVersion {
    /// Header size in bytes for this version.
    pub const fn header_size(self) -> usize {
        match self {
            Self::Nifti1 => 348,
            Self::Nifti2 => 540,
        }
    }
}

mod offsets_v1 {
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const XYZT_UNITS: usize = 123;
    pub const SFORM_CODE: usize = 254;
    pub const SROW_X: usize = 280;
    pub const MAGIC: usize = 344;
}

mod offsets_v2 {
    pub const MAGIC: usize = 4;
    pub const DATATYPE: usize = 12;
    pub const BITPIX: usize = 14;
    pub const DIM: usize = 16;
    pub const PIXDIM: usize = 104;
    pub const VOX_OFFSET: usize = 168;
    pub const SCL_SLOPE: usize = 176;
    pub const SCL_INTER: usize = 184;
}

/// `NIfTI` data type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum DataType {
    /// Unsigned 8-bit integer
    UInt8 = 2,
    /// Signed 16-bit integer
    Int16 = 4,
    /// Signed 32-bit integer
    Int32 = 8,
    /// 32-bit floating point
    Float32 = 16,
    /// 64-bit floating point
    Float64 = 64,
    /// Signed 8-bit integer
    Int8 = 256,
    /// Unsigned 16-bit integer
    UInt16 = 512,
    /// Unsigned 32-bit integer
    UInt32 = 768,
    /// Signed 64-bit integer
    Int64 = 1024,
    /// Unsigned 64-bit integer
    UInt64 = 1280,
    /// IEEE 754 half precision
    Float16 = 16384,
    /// bfloat16
    BFloat16 = 16385,
}

impl DataType {
    /// Parse from a `NIfTI` datatype code.
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            2 => Ok(Self::UInt8),
            4 => Ok(Self::Int16),
            8 => Ok(Self::Int32),
            16 => Ok(Self::Float32),
            64 => Ok(Self::Float64),
            256 => Ok(Self::Int8),
            512 => Ok(Self::UInt16),
            768 => Ok(Self::UInt32),
            1024 => Ok(Self::Int64),
            1280 => Ok(Self::UInt64),
            16384 => Ok(Self::Float16),
            16385 => Ok(Self::BFloat16),
            _ => Err(Error::UnsupportedDataType(code)),
        }
    }

    /// Size of each element in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }
}

/// The subset of the `NIfTI` header needed to decode voxel data.
#[derive(Debug, Clone)]
pub struct NiftiHeader {
    /// Format version detected from `sizeof_hdr`.
    pub version: NiftiVersion,
    /// Size along each used dimension.
    pub dims: Vec<usize>,
    /// On-disk element type.
    pub datatype: DataType,
    /// Voxel sizes for the used dimensions.
    pub spacing: Vec<f64>,
    /// Byte offset of the voxel data.
    pub vox_offset: usize,
    /// Intensity scaling slope (0 means "no scaling").
    pub scl_slope: f64,
    /// Intensity scaling intercept.
    pub scl_inter: f64,
    pub(crate) little_endian: bool,
}

impl NiftiHeader {
    /// Parse a header with automatic version and endianness detection.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "header too short to detect version",
            )));
        }

        let sizeof_le = LittleEndian::read_i32(&bytes[0..4]);
        let sizeof_be = BigEndian::read_i32(&bytes[0..4]);
        let (version, little_endian) = match (sizeof_le, sizeof_be) {
            (348, _) => (NiftiVersion::Nifti1, true),
            (_, 348) => (NiftiVersion::Nifti1, false),
            (540, _) => (NiftiVersion::Nifti2, true),
            (_, 540) => (NiftiVersion::Nifti2, false),
            _ => return Err(Error::InvalidMagic([bytes[0], bytes[1], bytes[2], bytes[3]])),
        };

        if bytes.len() < version.header_size() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "header too short: got {} bytes, need {} for {:?}",
                    bytes.len(),
                    version.header_size(),
                    version
                ),
            )));
        }

        match (version, little_endian) {
            (NiftiVersion::Nifti1, true) => Self::parse_v1::<LittleEndian>(bytes, true),
            (NiftiVersion::Nifti1, false) => Self::parse_v1::<BigEndian>(bytes, false),
            (NiftiVersion::Nifti2, true) => Self::parse_v2::<LittleEndian>(bytes, true),
            (NiftiVersion::Nifti2, false) => Self::parse_v2::<BigEndian>(bytes, false),
        }
    }

    #[allow(clippy::wildcard_imports)]
    fn parse_v1<E: ByteOrder>(bytes: &[u8], little_endian: bool) -> Result<Self> {
        use offsets_v1::*;

        let magic = &bytes[MAGIC..MAGIC + 4];
        if magic != b"n+1\0" && magic != b"ni1\0" {
            return Err(Error::InvalidMagic([magic[0], magic[1], magic[2], magic[3]]));
        }

        let ndim = E::read_i16(&bytes[DIM..DIM + 2]);
        let ndim = check_ndim(i64::from(ndim))?;
        let mut dims = Vec::with_capacity(ndim);
        for i in 0..ndim {
            let at = DIM + 2 + i * 2;
            dims.push(check_dim(i, i64::from(E::read_i16(&bytes[at..at + 2])))?);
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..DATATYPE + 2]))?;
        check_bitpix(datatype, E::read_i16(&bytes[BITPIX..BITPIX + 2]))?;

        let spacing = (0..ndim)
            .map(|i| {
                let at = PIXDIM + (i + 1) * 4;
                f64::from(E::read_f32(&bytes[at..at + 4]))
            })
            .collect();

        let vox_offset = E::read_f32(&bytes[VOX_OFFSET..VOX_OFFSET + 4]);
        if !vox_offset.is_finite() || vox_offset.fract() != 0.0 || vox_offset < 0.0 {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset must be a non-negative integer, got {}",
                vox_offset
            )));
        }

        Ok(Self {
            version: NiftiVersion::Nifti1,
            dims,
            datatype,
            spacing,
            // Single-file NIfTI-1 data never starts inside the header.
            vox_offset: (vox_offset as usize).max(NiftiVersion::Nifti1.header_size()),
            scl_slope: f64::from(E::read_f32(&bytes[SCL_SLOPE..SCL_SLOPE + 4])),
            scl_inter: f64::from(E::read_f32(&bytes[SCL_INTER..SCL_INTER + 4])),
            little_endian,
        })
    }

    #[allow(clippy::wildcard_imports)]
    fn parse_v2<E: ByteOrder>(bytes: &[u8], little_endian: bool) -> Result<Self> {
        use offsets_v2::*;

        let magic = &bytes[MAGIC..MAGIC + 4];
        if magic != b"n+2\0" && magic != b"ni2\0" {
            return Err(Error::InvalidMagic([magic[0], magic[1], magic[2], magic[3]]));
        }

        let ndim = check_ndim(E::read_i64(&bytes[DIM..DIM + 8]))?;
        let mut dims = Vec::with_capacity(ndim);
        for i in 0..ndim {
            let at = DIM + 8 + i * 8;
            dims.push(check_dim(i, E::read_i64(&bytes[at..at + 8]))?);
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..DATATYPE + 2]))?;
        check_bitpix(datatype, E::read_i16(&bytes[BITPIX..BITPIX + 2]))?;

        let spacing = (0..ndim)
            .map(|i| {
                let at = PIXDIM + (i + 1) * 8;
                E::read_f64(&bytes[at..at + 8])
            })
            .collect();

        let vox_offset = E::read_i64(&bytes[VOX_OFFSET..VOX_OFFSET + 8]);
        if vox_offset < 0 {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset must be non-negative, got {}",
                vox_offset
            )));
        }

        Ok(Self {
            version: NiftiVersion::Nifti2,
            dims,
            datatype,
            spacing,
            vox_offset: (vox_offset as usize).max(NiftiVersion::Nifti2.header_size()),
            scl_slope: E::read_f64(&bytes[SCL_SLOPE..SCL_SLOPE + 8]),
            scl_inter: E::read_f64(&bytes[SCL_INTER..SCL_INTER + 8]),
            little_endian,
        })
    }

    /// Volume shape as stored in the header.
    pub fn shape(&self) -> &[usize] {
        &self.dims
    }

    /// Number of voxels.
    pub fn num_voxels(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of payload bytes.
    pub fn data_size(&self) -> usize {
        self.num_voxels() * self.datatype.byte_size()
    }

    /// Whether the file is little endian.
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    fn scaling(&self) -> Option<(f32, f32)> {
        let trivial = self.scl_slope == 0.0 || (self.scl_slope == 1.0 && self.scl_inter == 0.0);
        if trivial || !self.scl_slope.is_finite() || !self.scl_inter.is_finite() {
            None
        } else {
            Some((self.scl_slope as f32, self.scl_inter as f32))
        }
    }
}

fn check_ndim(raw: i64) -> Result<usize> {
    if !(1..=7).contains(&raw) {
        return Err(Error::InvalidDimensions(format!(
            "ndim must be 1..=7, got {}",
            raw
        )));
    }
    Ok(raw as usize)
}

fn check_dim(axis: usize, raw: i64) -> Result<usize> {
    if raw < 1 {
        return Err(Error::InvalidDimensions(format!(
            "dimension {} must be positive, got {}",
            axis, raw
        )));
    }
    Ok(raw as usize)
}

fn check_bitpix(datatype: DataType, bitpix: i16) -> Result<()> {
    let expected = (datatype.byte_size() * 8) as i16;
    if bitpix != expected {
        return Err(Error::InvalidDimensions(format!(
            "bitpix {} does not match datatype {:?} (expected {})",
            bitpix, datatype, expected
        )));
    }
    Ok(())
}

/// Decode raw voxel bytes into `f32`.
fn decode_voxels<E: ByteOrder>(raw: &[u8], datatype: DataType) -> Vec<f32> {
    match datatype {
        DataType::UInt8 => raw.iter().map(|&v| f32::from(v)).collect(),
        DataType::Int8 => raw.iter().map(|&v| f32::from(v as i8)).collect(),
        DataType::Int16 => raw.chunks_exact(2).map(|c| f32::from(E::read_i16(c))).collect(),
        DataType::UInt16 => raw.chunks_exact(2).map(|c| f32::from(E::read_u16(c))).collect(),
        DataType::Int32 => raw.chunks_exact(4).map(|c| E::read_i32(c) as f32).collect(),
        DataType::UInt32 => raw.chunks_exact(4).map(|c| E::read_u32(c) as f32).collect(),
        DataType::Int64 => raw.chunks_exact(8).map(|c| E::read_i64(c) as f32).collect(),
        DataType::UInt64 => raw.chunks_exact(8).map(|c| E::read_u64(c) as f32).collect(),
        DataType::Float32 => raw.chunks_exact(4).map(E::read_f32).collect(),
        DataType::Float64 => raw.chunks_exact(8).map(|c| E::read_f64(c) as f32).collect(),
        DataType::Float16 => raw
            .chunks_exact(2)
            .map(|c| f16::from_bits(E::read_u16(c)).to_f32())
            .collect(),
        DataType::BFloat16 => raw
            .chunks_exact(2)
            .map(|c| bf16::from_bits(E::read_u16(c)).to_f32())
            .collect(),
    }
}

/// Build a row-major volume from a complete in-memory NIfTI file.
fn volume_from_bytes(bytes: &[u8]) -> Result<Volume> {
    let header = NiftiHeader::from_bytes(bytes)?;
    let start = header.vox_offset;
    let end = start + header.data_size();
    if bytes.len() < end {
        return Err(Error::InvalidDimensions(format!(
            "file truncated: header describes {} data bytes at offset {}, but file has {} bytes",
            header.data_size(),
            start,
            bytes.len()
        )));
    }

    let raw = &bytes[start..end];
    let mut voxels = if header.little_endian {
        decode_voxels::<LittleEndian>(raw, header.datatype)
    } else {
        decode_voxels::<BigEndian>(raw, header.datatype)
    };
    if let Some((slope, inter)) = header.scaling() {
        voxels.iter_mut().for_each(|v| *v = *v * slope + inter);
    }

    // NIfTI stores the first axis fastest.
    let fortran = ArrayD::from_shape_vec(IxDyn(&header.dims).f(), voxels)
        .map_err(|e| Error::InvalidDimensions(format!("voxel count mismatch: {}", e)))?;
    Ok(fortran.as_standard_layout().into_owned())
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

/// Inflate a (possibly multi-member) gzip payload.
pub(crate) fn gunzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(compressed);
    let mut out = Vec::with_capacity(compressed.len().saturating_mul(4));
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Decompression(format!("gzip decompression failed: {e}")))?;
    Ok(out)
}

/// Load a `.nii` or `.nii.gz` file as an `f32` volume.
#[allow(unsafe_code)]
pub fn load<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let file = File::open(path)?;
    if is_gzipped(path) {
        let mut compressed = Vec::new();
        (&file).read_to_end(&mut compressed)?;
        let bytes = gunzip(&compressed)?;
        volume_from_bytes(&bytes)
    } else {
        // SAFETY: the file is opened read-only and the map is dropped before returning.
        let mmap = unsafe { Mmap::map(&file)? };
        volume_from_bytes(&mmap)
    }
}

/// Read only the header of a `.nii` or `.nii.gz` file.
pub fn load_header<P: AsRef<Path>>(path: P) -> Result<NiftiHeader> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut bytes = Vec::with_capacity(NiftiVersion::Nifti2.header_size());
    if is_gzipped(path) {
        MultiGzDecoder::new(file)
            .take(NiftiVersion::Nifti2.header_size() as u64)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::Decompression(format!("gzip header read failed: {e}")))?;
    } else {
        file.take(NiftiVersion::Nifti2.header_size() as u64)
            .read_to_end(&mut bytes)?;
    }
    NiftiHeader::from_bytes(&bytes)
}

/// Serialize a volume as a little-endian NIfTI-1 `float32` file image.
fn to_nifti1_bytes(volume: &Volume) -> Result<Vec<u8>> {
    use offsets_v1::*;

    let ndim = volume.ndim();
    if ndim == 0 || ndim > 7 {
        return Err(Error::InvalidDimensions(format!(
            "NIfTI supports 1 to 7 dimensions, got {}",
            ndim
        )));
    }
    if let Some(&dim) = volume.shape().iter().find(|&&d| d > i16::MAX as usize) {
        return Err(Error::InvalidDimensions(format!(
            "dimension {} exceeds the NIfTI-1 limit of {}",
            dim,
            i16::MAX
        )));
    }

    const VOX_OFFSET_V1: usize = 352;
    let mut bytes = vec![0u8; VOX_OFFSET_V1 + volume.len() * 4];
    LittleEndian::write_i32(&mut bytes[0..4], 348);

    LittleEndian::write_i16(&mut bytes[DIM..DIM + 2], ndim as i16);
    for i in 0..7 {
        let at = DIM + 2 + i * 2;
        let dim = volume.shape().get(i).copied().unwrap_or(1);
        LittleEndian::write_i16(&mut bytes[at..at + 2], dim as i16);
    }
    LittleEndian::write_i16(&mut bytes[DATATYPE..DATATYPE + 2], DataType::Float32 as i16);
    LittleEndian::write_i16(&mut bytes[BITPIX..BITPIX + 2], 32);
    for i in 0..8 {
        let at = PIXDIM + i * 4;
        LittleEndian::write_f32(&mut bytes[at..at + 4], 1.0);
    }
    LittleEndian::write_f32(&mut bytes[VOX_OFFSET..VOX_OFFSET + 4], VOX_OFFSET_V1 as f32);
    LittleEndian::write_f32(&mut bytes[SCL_SLOPE..SCL_SLOPE + 4], 1.0);
    bytes[XYZT_UNITS] = 2; // millimeters
    LittleEndian::write_i16(&mut bytes[SFORM_CODE..SFORM_CODE + 2], 1);
    for row in 0..3 {
        let at = SROW_X + row * 16 + row * 4;
        LittleEndian::write_f32(&mut bytes[at..at + 4], 1.0);
    }
    bytes[MAGIC..MAGIC + 4].copy_from_slice(b"n+1\0");

    // Transposed logical order is the original's Fortran order.
    let payload = &mut bytes[VOX_OFFSET_V1..];
    for (chunk, &v) in payload.chunks_exact_mut(4).zip(volume.t().iter()) {
        LittleEndian::write_f32(chunk, v);
    }
    Ok(bytes)
}

/// Save a volume as NIfTI-1 `float32`; a `.gz` suffix selects gzip compression.
pub fn save<P: AsRef<Path>>(volume: &Volume, path: P) -> Result<()> {
    let path = path.as_ref();
    let bytes = to_nifti1_bytes(volume)?;
    let writer = BufWriter::new(File::create(path)?);
    if is_gzipped(path) {
        let mut encoder = GzEncoder::new(writer, Compression::fast());
        encoder.write_all(&bytes)?;
        encoder.finish()?.flush()?;
    } else {
        let mut writer = writer;
        writer.write_all(&bytes)?;
        writer.flush()?;
    }
    Ok(())
}
