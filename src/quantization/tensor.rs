//! Quantized tensor representation.

use std::borrow::Cow;
use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use super::double_quant::DoubleQuantizedScales;
use crate::utils::{dtype_from_tag, dtype_tag};
use crate::Nf4Error;

const MAGIC: &[u8; 4] = b"NF4Q";
const FORMAT_VERSION: u8 = 1;

/// Per-block scale storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockScales {
    /// One absmax per block
    Full(Vec<f32>),
    /// Absmax values re-quantized to 8 bits
    DoubleQuantized(DoubleQuantizedScales),
}

impl BlockScales {
    /// Number of blocks covered
    pub fn len(&self) -> usize {
        match self {
            BlockScales::Full(scales) => scales.len(),
            BlockScales::DoubleQuantized(dq) => dq.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scales as f32, reconstructing double-quantized values
    pub fn values(&self) -> Cow<'_, [f32]> {
        match self {
            BlockScales::Full(scales) => Cow::Borrowed(scales),
            BlockScales::DoubleQuantized(dq) => Cow::Owned(dq.dequantize()),
        }
    }

    /// Storage cost in bytes
    pub fn storage_bytes(&self) -> usize {
        match self {
            BlockScales::Full(scales) => scales.len() * 4,
            BlockScales::DoubleQuantized(dq) => dq.storage_bytes(),
        }
    }
}

/// A quantized tensor: packed NF4 indices plus the scales needed to decode them.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    /// Packed indices, two per byte
    pub data: Vec<u8>,

    /// Per-block scales
    pub scales: BlockScales,

    /// Original tensor shape
    pub shape: Vec<usize>,

    /// Original dtype
    pub dtype: DType,

    /// Block size used for quantization
    pub block_size: usize,
}

impl QuantizedTensor {
    /// Create a new quantized tensor
    pub fn new(
        data: Vec<u8>,
        scales: BlockScales,
        shape: Vec<usize>,
        dtype: DType,
        block_size: usize,
    ) -> Self {
        Self {
            data,
            scales,
            shape,
            dtype,
            block_size,
        }
    }

    /// Get the number of elements in the original tensor.
    ///
    /// Saturates at `usize::MAX` for a shape whose product overflows; such an
    /// artifact never passes [`QuantizedTensor::validate`].
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }

    fn checked_numel(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    pub fn n_blocks(&self) -> usize {
        self.numel().checked_div(self.block_size).unwrap_or(0)
    }

    pub fn is_double_quantized(&self) -> bool {
        matches!(self.scales, BlockScales::DoubleQuantized(_))
    }

    /// Check metadata against the buffers. Nothing is truncated or padded.
    pub fn validate(&self) -> crate::Result<()> {
        if self.block_size == 0 || self.block_size % 2 != 0 {
            return Err(Nf4Error::Shape(format!(
                "block size must be positive and even, got {}",
                self.block_size
            )));
        }
        let numel = self.checked_numel().ok_or_else(|| {
            Nf4Error::Shape(format!("shape {:?} overflows the element count", self.shape))
        })?;
        if numel % self.block_size != 0 {
            return Err(Nf4Error::Shape(format!(
                "{} elements are not divisible by block size {}",
                numel, self.block_size
            )));
        }
        if self.data.len().checked_mul(2) != Some(numel) {
            return Err(Nf4Error::Shape(format!(
                "packed buffer holds {} bytes, shape {:?} needs {}",
                self.data.len(),
                self.shape,
                numel / 2
            )));
        }
        let n_blocks = numel / self.block_size;
        if self.scales.len() != n_blocks {
            return Err(Nf4Error::Shape(format!(
                "{} block scales for {} blocks",
                self.scales.len(),
                n_blocks
            )));
        }
        if let BlockScales::DoubleQuantized(dq) = &self.scales {
            dq.validate()?;
        }
        Ok(())
    }

    /// Get compressed size in bytes
    pub fn compressed_size(&self) -> usize {
        self.data.len() + self.scales.storage_bytes()
    }

    /// Get original size in bytes
    pub fn original_size(&self) -> usize {
        self.numel().saturating_mul(self.dtype.size_in_bytes())
    }

    /// Get compression ratio
    pub fn compression_ratio(&self) -> f32 {
        self.compressed_size() as f32 / self.original_size() as f32
    }

    /// Serialize to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.compressed_size() + 64);

        // Header: magic, version, dtype, block size, shape
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.push(dtype_tag(self.dtype));
        bytes.extend_from_slice(&(self.block_size as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.shape.len() as u32).to_le_bytes());
        for dim in &self.shape {
            bytes.extend_from_slice(&(*dim as u64).to_le_bytes());
        }

        match &self.scales {
            BlockScales::Full(scales) => {
                bytes.push(0);
                bytes.extend_from_slice(&(scales.len() as u32).to_le_bytes());
                for scale in scales {
                    bytes.extend_from_slice(&scale.to_le_bytes());
                }
            }
            BlockScales::DoubleQuantized(dq) => {
                bytes.push(1);
                bytes.extend_from_slice(&(dq.scaler_block_size as u32).to_le_bytes());
                bytes.extend_from_slice(&dq.scaler_mean.to_le_bytes());
                bytes.extend_from_slice(&(dq.group_absmax.len() as u32).to_le_bytes());
                for factor in &dq.group_absmax {
                    bytes.extend_from_slice(&factor.to_le_bytes());
                }
                bytes.extend_from_slice(&(dq.indices.len() as u32).to_le_bytes());
                bytes.extend(dq.indices.iter().map(|&i| i as u8));
            }
        }

        // Data length and bytes
        bytes.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&self.data);

        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let mut reader = ByteReader::new(bytes);

        if reader.take(4)? != MAGIC {
            return Err(Nf4Error::Serialization("missing NF4Q magic".to_string()));
        }
        let version = reader.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(Nf4Error::Serialization(format!(
                "unsupported format version {}",
                version
            )));
        }
        let tag = reader.read_u8()?;
        let dtype = dtype_from_tag(tag)
            .ok_or_else(|| Nf4Error::Serialization(format!("unknown dtype tag {}", tag)))?;
        let block_size = reader.read_u32()? as usize;

        let shape_len = reader.read_u32()? as usize;
        let mut shape = Vec::with_capacity(shape_len.min(16));
        for _ in 0..shape_len {
            shape.push(reader.read_u64()? as usize);
        }

        let scales = match reader.read_u8()? {
            0 => {
                let n = reader.read_u32()? as usize;
                BlockScales::Full(reader.read_f32_vec(n)?)
            }
            1 => {
                let scaler_block_size = reader.read_u32()? as usize;
                let scaler_mean = reader.read_f32()?;
                let n_groups = reader.read_u32()? as usize;
                let group_absmax = reader.read_f32_vec(n_groups)?;
                let n_indices = reader.read_u32()? as usize;
                let indices = reader.take(n_indices)?.iter().map(|&b| b as i8).collect();
                BlockScales::DoubleQuantized(DoubleQuantizedScales {
                    indices,
                    group_absmax,
                    scaler_mean,
                    scaler_block_size,
                })
            }
            other => {
                return Err(Nf4Error::Serialization(format!(
                    "unknown scale encoding {}",
                    other
                )))
            }
        };

        let data_len = reader.read_u64()? as usize;
        let data = reader.take(data_len)?.to_vec();
        if !reader.is_exhausted() {
            return Err(Nf4Error::Serialization(format!(
                "{} trailing bytes after packed data",
                reader.remaining()
            )));
        }

        let tensor = Self {
            data,
            scales,
            shape,
            dtype,
            block_size,
        };
        tensor.validate()?;
        Ok(tensor)
    }

    /// Write the serialized artifact to a file
    pub fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Read a serialized artifact from a file
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

/// Bounds-checked little-endian reader
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> crate::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                Nf4Error::Serialization(format!(
                    "unexpected end of data: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> crate::Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> crate::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> crate::Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    fn read_u64(&mut self) -> crate::Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    fn read_f32(&mut self) -> crate::Result<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    fn read_f32_vec(&mut self, n: usize) -> crate::Result<Vec<f32>> {
        let raw = self.take(n.checked_mul(4).ok_or_else(|| {
            Nf4Error::Serialization(format!("scale count {} overflows", n))
        })?)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(scales: BlockScales) -> QuantizedTensor {
        QuantizedTensor::new(
            vec![0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0],
            scales,
            vec![2, 8],
            DType::BF16,
            4,
        )
    }

    #[test]
    fn test_serialization_roundtrip_full() {
        let qt = sample(BlockScales::Full(vec![1.0, 2.0, 0.5, 0.0]));
        assert!(qt.validate().is_ok());

        let restored = QuantizedTensor::from_bytes(&qt.to_bytes()).unwrap();
        assert_eq!(restored, qt);
    }

    #[test]
    fn test_serialization_roundtrip_double() {
        let dq = DoubleQuantizedScales::quantize(&[1.0, 2.0, 0.5, 0.25], 3).unwrap();
        let qt = sample(BlockScales::DoubleQuantized(dq));

        let restored = QuantizedTensor::from_bytes(&qt.to_bytes()).unwrap();
        assert_eq!(restored, qt);
        assert!(restored.is_double_quantized());
        assert_eq!(restored.dtype, DType::BF16);
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let bytes = sample(BlockScales::Full(vec![1.0; 4])).to_bytes();
        for cut in [0, 3, 10, bytes.len() - 1] {
            assert!(
                matches!(QuantizedTensor::from_bytes(&bytes[..cut]), Err(Nf4Error::Serialization(_))),
                "cut at {} accepted",
                cut
            );
        }
    }

    #[test]
    fn test_bad_magic_and_trailing_bytes() {
        let mut bytes = sample(BlockScales::Full(vec![1.0; 4])).to_bytes();
        bytes.push(0);
        assert!(QuantizedTensor::from_bytes(&bytes).is_err());
        bytes[0] = b'X';
        assert!(QuantizedTensor::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_validate_mismatches() {
        let mut qt = sample(BlockScales::Full(vec![1.0; 4]));
        qt.data.pop();
        assert!(matches!(qt.validate(), Err(Nf4Error::Shape(_))));

        let qt = sample(BlockScales::Full(vec![1.0; 3]));
        assert!(matches!(qt.validate(), Err(Nf4Error::Shape(_))));

        let mut qt = sample(BlockScales::Full(vec![1.0; 4]));
        qt.block_size = 3;
        assert!(matches!(qt.validate(), Err(Nf4Error::Shape(_))));
    }

    fn header_with_shape(shape: &[u64]) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.push(FORMAT_VERSION);
        bytes.push(dtype_tag(DType::F32));
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&(shape.len() as u32).to_le_bytes());
        for dim in shape {
            bytes.extend_from_slice(&dim.to_le_bytes());
        }
        // full scales, none stored, empty data
        bytes.push(0);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        for shape in [[u64::MAX, 2], [1 << 63, 2], [1 << 32, 1 << 32]] {
            let result = QuantizedTensor::from_bytes(&header_with_shape(&shape));
            assert!(matches!(result, Err(Nf4Error::Shape(_))), "shape {:?} accepted", shape);
        }

        let qt = QuantizedTensor::new(
            Vec::new(),
            BlockScales::Full(Vec::new()),
            vec![usize::MAX, 2],
            DType::F32,
            2,
        );
        assert_eq!(qt.numel(), usize::MAX);
        assert_eq!(qt.original_size(), usize::MAX);
        assert!(qt.validate().is_err());
    }

    #[test]
    fn test_zero_block_size_has_no_blocks() {
        let mut qt = sample(BlockScales::Full(vec![1.0; 4]));
        qt.block_size = 0;
        assert_eq!(qt.n_blocks(), 0);
        assert!(matches!(qt.validate(), Err(Nf4Error::Shape(_))));
    }

    #[test]
    fn test_sizes() {
        let qt = sample(BlockScales::Full(vec![1.0; 4]));
        assert_eq!(qt.original_size(), 32);
        assert_eq!(qt.compressed_size(), 8 + 16);
        assert!((qt.compression_ratio() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.nf4");
        let qt = sample(BlockScales::Full(vec![1.0, 2.0, 3.0, 4.0]));
        qt.save(&path).unwrap();
        assert_eq!(QuantizedTensor::load(&path).unwrap(), qt);
    }
}
