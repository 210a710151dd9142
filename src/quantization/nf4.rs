//! Block-parallel NF4 codec.
//!
//! Every block owns `block_size / 2` bytes of the packed buffer and `block_size`
//! floats of the decoded output, so blocks are encoded and decoded independently
//! across the rayon pool without synchronization.

use candle_core::Tensor;
use rayon::prelude::*;

use super::block::{block_absmax, par_block_absmax};
use super::packing::{pack_into, unpack_nibbles};
use super::scalar::{dequantize_value, quantize_block};
use super::{encode_scales, prepare_input, restore_tensor, QuantizedTensor, Quantizer};
use crate::config::CodecConfig;
use crate::Nf4Error;

/// NF4 quantizer for 4-bit weight compression
#[derive(Debug, Clone, Default)]
pub struct Nf4Quantizer {
    config: CodecConfig,
}

impl Nf4Quantizer {
    /// Create a new NF4 quantizer with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Create with custom block size, keeping the other defaults
    pub fn with_block_size(block_size: usize) -> Self {
        Self::with_config(CodecConfig::default().with_block_size(block_size))
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Quantize already-flattened values into `(scales, packed)`
    pub(crate) fn encode_slice(&self, data: &[f32]) -> crate::Result<(Vec<f32>, Vec<u8>)> {
        let block_size = self.config.block_size;
        if block_size == 0 || block_size % 2 != 0 || data.len() % block_size != 0 {
            return Err(Nf4Error::Shape(format!(
                "{} values do not split into even blocks of {}",
                data.len(),
                block_size
            )));
        }
        let half = block_size / 2;
        let mut packed = vec![0u8; data.len() / 2];

        if self.config.parallel {
            let scales = par_block_absmax(data, block_size);
            packed
                .par_chunks_mut(half)
                .zip(data.par_chunks(block_size))
                .zip(scales.par_iter())
                .for_each_init(
                    || vec![0u8; block_size],
                    |indices, ((out, block), &scale)| {
                        quantize_block(block, scale, indices);
                        pack_into(indices, out);
                    },
                );
            Ok((scales, packed))
        } else {
            let scales = block_absmax(data, block_size);
            let mut indices = vec![0u8; block_size];
            for ((out, block), &scale) in packed
                .chunks_mut(half)
                .zip(data.chunks(block_size))
                .zip(&scales)
            {
                quantize_block(block, scale, &mut indices);
                pack_into(&indices, out);
            }
            Ok((scales, packed))
        }
    }

    /// Decode packed bytes with per-block `scales` into flat values
    pub(crate) fn decode_slice(
        &self,
        packed: &[u8],
        scales: &[f32],
        block_size: usize,
    ) -> crate::Result<Vec<f32>> {
        if block_size == 0
            || block_size % 2 != 0
            || (packed.len() * 2) % block_size != 0
            || scales.len() != packed.len() * 2 / block_size
        {
            return Err(Nf4Error::Shape(format!(
                "{} packed bytes and {} scales do not match block size {}",
                packed.len(),
                scales.len(),
                block_size
            )));
        }
        let mut output = vec![0.0f32; packed.len() * 2];

        if self.config.parallel {
            output
                .par_chunks_mut(block_size)
                .zip(packed.par_chunks(block_size / 2))
                .zip(scales.par_iter())
                .for_each(|((out, bytes), &scale)| decode_block(bytes, scale, out));
        } else {
            for ((out, bytes), &scale) in output
                .chunks_mut(block_size)
                .zip(packed.chunks(block_size / 2))
                .zip(scales)
            {
                decode_block(bytes, scale, out);
            }
        }

        Ok(output)
    }
}

fn decode_block(bytes: &[u8], scale: f32, out: &mut [f32]) {
    for (pair, &byte) in out.chunks_exact_mut(2).zip(bytes) {
        let (high, low) = unpack_nibbles(byte);
        pair[0] = dequantize_value(high) * scale;
        pair[1] = dequantize_value(low) * scale;
    }
}

impl Quantizer for Nf4Quantizer {
    fn quantize(&self, tensor: &Tensor) -> crate::Result<QuantizedTensor> {
        let input = prepare_input(tensor, &self.config)?;
        let (scales, packed) = self.encode_slice(&input.data)?;

        tracing::debug!(
            "Quantized {:?} into {} blocks of {} ({} bytes packed)",
            input.shape,
            scales.len(),
            self.config.block_size,
            packed.len()
        );

        Ok(QuantizedTensor::new(
            packed,
            encode_scales(scales, &self.config)?,
            input.shape,
            input.dtype,
            self.config.block_size,
        ))
    }

    fn dequantize(&self, quantized: &QuantizedTensor) -> crate::Result<Tensor> {
        quantized.validate()?;
        let scales = quantized.scales.values();
        let output = self.decode_slice(&quantized.data, &scales, quantized.block_size)?;
        restore_tensor(output, quantized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::codebook::NF4_CODEBOOK;
    use crate::quantization::scalar::gap_below;
    use crate::quantization::BlockScales;
    use crate::utils::normal_weight;
    use candle_core::{DType, Device};

    #[test]
    fn test_nf4_roundtrip() {
        let quantizer = Nf4Quantizer::with_config(CodecConfig::single(8));

        let data = vec![0.1f32, -0.5, 0.8, -0.2, 0.0, 0.3, -0.7, 0.9];
        let tensor = Tensor::from_vec(data.clone(), &[8], &Device::Cpu).unwrap();

        let quantized = quantizer.quantize(&tensor).unwrap();
        let restored = quantizer.dequantize(&quantized).unwrap();

        assert_eq!(restored.dims(), tensor.dims());

        // first-at-or-above rounding never errs by more than the widest gap times the scale
        let restored_data: Vec<f32> = restored.to_dtype(DType::F32).unwrap().to_vec1().unwrap();
        for (orig, rest) in data.iter().zip(restored_data.iter()) {
            let error = (orig - rest).abs();
            assert!(error < 0.31 * 0.9, "Error too large: {} vs {} (diff: {})", orig, rest, error);
            assert!(rest >= orig, "value rounded down: {} -> {}", orig, rest);
        }
        // the absmax element is exact
        assert_eq!(restored_data[7], 0.9);
    }

    #[test]
    fn test_scenario_bf16_16384() {
        let tensor = normal_weight(&[1, 16384], DType::BF16, 0).unwrap();
        let quantizer = Nf4Quantizer::with_config(CodecConfig::single(64));
        let quantized = quantizer.quantize(&tensor).unwrap();

        assert_eq!(quantized.data.len(), 8192);
        assert_eq!(quantized.n_blocks(), 256);
        assert_eq!(quantized.dtype, DType::BF16);

        let flat: Vec<f32> = tensor.flatten_all().unwrap().to_dtype(DType::F32).unwrap().to_vec1().unwrap();
        let BlockScales::Full(scales) = &quantized.scales else {
            panic!("expected full scales");
        };
        assert_eq!(scales.len(), 256);
        for (i, block) in flat.chunks(64).enumerate() {
            let expected = block.iter().fold(0.0f32, |m, x| m.max(x.abs()));
            assert!((scales[i] - expected).abs() < 1e-6, "block {}", i);
        }
    }

    #[test]
    fn test_roundtrip_error_bound() {
        for block_size in [32, 64] {
            let tensor = normal_weight(&[16384], DType::F32, 42).unwrap();
            let quantizer = Nf4Quantizer::with_config(CodecConfig::single(block_size));
            let quantized = quantizer.quantize(&tensor).unwrap();
            let restored: Vec<f32> = quantizer.dequantize(&quantized).unwrap().to_vec1().unwrap();
            let original: Vec<f32> = tensor.to_vec1().unwrap();

            let scales = quantized.scales.values();
            let indices = crate::quantization::packing::unpack_bytes(&quantized.data);
            let mut sum = 0.0f32;
            for (i, (o, r)) in original.iter().zip(&restored).enumerate() {
                let scale = scales[i / block_size];
                let error = (o - r).abs();
                assert!(
                    error <= gap_below(indices[i]) * scale + 1e-5,
                    "element {} error {} exceeds gap bound",
                    i,
                    error
                );
                assert_eq!(*r, NF4_CODEBOOK[indices[i] as usize] * scale);
                sum += error;
            }
            let max_scale = scales.iter().fold(0.0f32, |m, &s| m.max(s));
            let max_error = original.iter().zip(&restored).fold(0.0f32, |m, (o, r)| m.max((o - r).abs()));
            assert!(max_error <= 0.31 * max_scale);
            assert!(sum / (original.len() as f32) < 0.2, "mean error {}", sum / original.len() as f32);
        }
    }

    #[test]
    fn test_parallel_matches_serial() {
        let tensor = normal_weight(&[32, 128], DType::F32, 3).unwrap();
        let parallel = Nf4Quantizer::with_config(CodecConfig::default());
        let serial = Nf4Quantizer::with_config(CodecConfig::default().with_parallel(false));

        let a = parallel.quantize(&tensor).unwrap();
        let b = serial.quantize(&tensor).unwrap();
        assert_eq!(a, b);

        let ra: Vec<f32> = parallel.dequantize(&a).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let rb: Vec<f32> = serial.dequantize(&b).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(ra, rb);
    }

    #[test]
    fn test_zero_block() {
        let mut data = vec![0.0f32; 64];
        data.extend((0..64).map(|i| i as f32 / 64.0 - 0.5));
        let tensor = Tensor::from_vec(data, (2, 64), &Device::Cpu).unwrap();

        let quantizer = Nf4Quantizer::with_config(CodecConfig::single(64));
        let quantized = quantizer.quantize(&tensor).unwrap();
        // two zero-codepoint indices per byte
        assert!(quantized.data[..32].iter().all(|&b| b == 0x77));

        let restored: Vec<f32> = quantizer.dequantize(&quantized).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(restored[..64].iter().all(|&v| v == 0.0));
        assert!(restored.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_shape_errors() {
        let quantizer = Nf4Quantizer::with_block_size(64);
        let tensor = Tensor::zeros((3, 30), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(quantizer.quantize(&tensor), Err(crate::Nf4Error::Shape(_))));

        // an odd block size cannot pair nibbles; it is refused as configuration
        let odd = Nf4Quantizer::with_config(CodecConfig::single(3));
        let tensor = Tensor::zeros(6, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(odd.quantize(&tensor), Err(crate::Nf4Error::Config(_))));
    }

    #[test]
    fn test_slice_lengths_checked() {
        let quantizer = Nf4Quantizer::with_config(CodecConfig::single(4));
        assert!(matches!(quantizer.encode_slice(&[0.5; 6]), Err(Nf4Error::Shape(_))));

        let (scales, packed) = quantizer.encode_slice(&[0.5; 8]).unwrap();
        assert_eq!((scales.len(), packed.len()), (2, 4));
        assert_eq!(quantizer.decode_slice(&packed, &scales, 4).unwrap().len(), 8);

        // one scale short of the two blocks
        assert!(matches!(quantizer.decode_slice(&packed, &scales[..1], 4), Err(Nf4Error::Shape(_))));
        assert!(matches!(quantizer.decode_slice(&packed[..3], &scales, 4), Err(Nf4Error::Shape(_))));
        assert!(matches!(quantizer.decode_slice(&packed, &scales, 3), Err(Nf4Error::Shape(_))));
    }

    #[test]
    fn test_decode_rejects_mismatched_buffer() {
        let tensor = normal_weight(&[4, 64], DType::F32, 5).unwrap();
        let quantizer = Nf4Quantizer::new();
        let mut quantized = quantizer.quantize(&tensor).unwrap();
        quantized.data.truncate(100);
        assert!(matches!(quantizer.dequantize(&quantized), Err(crate::Nf4Error::Shape(_))));
    }

    #[test]
    fn test_nan_propagates_to_block() {
        let mut data = vec![0.25f32; 128];
        data[3] = f32::NAN;
        let tensor = Tensor::from_vec(data, 128, &Device::Cpu).unwrap();

        let quantizer = Nf4Quantizer::with_config(CodecConfig::single(64));
        let restored: Vec<f32> = quantizer
            .dequantize(&quantizer.quantize(&tensor).unwrap())
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(restored[..64].iter().all(|v| v.is_nan()));
        assert!(restored[64..].iter().all(|&v| v == 0.25));
    }

    #[test]
    fn test_nan_spreads_through_double_quantized_scales() {
        let mut data = vec![0.25f32; 1024];
        data[700] = f32::NAN;
        let tensor = Tensor::from_vec(data, (4, 256), &Device::Cpu).unwrap();

        for parallel in [true, false] {
            let config = CodecConfig::default().with_scaler_block_size(Some(256)).with_parallel(parallel);
            let quantizer = Nf4Quantizer::with_config(config);
            let quantized = quantizer.quantize(&tensor).unwrap();
            assert!(quantized.is_double_quantized());

            // the NaN enters the scale mean, so no block keeps a finite scale
            assert!(quantized.scales.values().iter().all(|s| s.is_nan()));
            let restored: Vec<f32> = quantizer.dequantize(&quantized).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(restored.len(), 1024);
            assert!(restored.iter().all(|v| !v.is_finite()));
        }
    }

    #[test]
    fn test_infinity_propagates_to_block() {
        let mut data = vec![-0.5f32; 128];
        data[10] = f32::INFINITY;
        data[20] = f32::NEG_INFINITY;
        let tensor = Tensor::from_vec(data, 128, &Device::Cpu).unwrap();

        let quantizer = Nf4Quantizer::with_config(CodecConfig::single(64));
        let quantized = quantizer.quantize(&tensor).unwrap();
        assert_eq!(quantized.scales.values()[0], f32::INFINITY);

        // finite / inf lands on the zero codepoint, inf / inf is NaN and saturates
        let indices = crate::quantization::packing::unpack_bytes(&quantized.data);
        assert_eq!(indices[0], crate::quantization::codebook::ZERO_INDEX);
        assert_eq!(indices[10], 15);
        assert_eq!(indices[20], 15);

        let restored: Vec<f32> = quantizer.dequantize(&quantized).unwrap().to_vec1().unwrap();
        // 0 * inf
        assert!(restored[0].is_nan());
        assert_eq!(restored[10], f32::INFINITY);
        assert_eq!(restored[20], f32::INFINITY);
        assert!(restored[..64].iter().all(|v| !v.is_finite()));
        assert!(restored[64..].iter().all(|&v| v == -0.5));
    }

    #[test]
    fn test_compression_ratio() {
        let data: Vec<f32> = (0..1024).map(|i| (i as f32) / 1024.0 - 0.5).collect();
        let tensor = Tensor::from_vec(data, &[1024], &Device::Cpu).unwrap().to_dtype(DType::F16).unwrap();

        let single = Nf4Quantizer::with_config(CodecConfig::single(64)).quantize(&tensor).unwrap();
        let double = Nf4Quantizer::new().quantize(&tensor).unwrap();

        // f16: 2048 bytes; packed 512 plus 16 f32 scales, or 16 i8 + 1 factor + mean
        assert_eq!(single.compressed_size(), 512 + 64);
        assert_eq!(double.compressed_size(), 512 + 16 + 4 + 4);
        assert!(double.compression_ratio() < single.compression_ratio());
    }
}
