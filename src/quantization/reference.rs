//! Element-by-element NF4 codec.
//!
//! Slow and single-threaded on purpose; it spells out every index computation so
//! the block-parallel [`super::Nf4Quantizer`] can be checked against it.

use candle_core::Tensor;

use super::codebook::ZERO_INDEX;
use super::packing::{pack_nibbles, unpack_nibbles};
use super::scalar::{dequantize_value, quantize_value};
use super::{encode_scales, prepare_input, restore_tensor, QuantizedTensor, Quantizer};
use crate::config::CodecConfig;

#[derive(Debug, Clone, Default)]
pub struct ReferenceQuantizer {
    config: CodecConfig,
}

impl ReferenceQuantizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Absmax of each block, one block at a time
    fn scalers(&self, data: &[f32]) -> Vec<f32> {
        let block_size = self.config.block_size;
        let mut scalers = Vec::with_capacity(data.len() / block_size);
        let mut block_start = 0;
        while block_start < data.len() {
            let block_end = (block_start + block_size).min(data.len());
            let mut block_max = 0.0f32;
            for &value in &data[block_start..block_end] {
                if value.is_nan() || block_max.is_nan() {
                    block_max = f32::NAN;
                } else if value.abs() > block_max {
                    block_max = value.abs();
                }
            }
            scalers.push(block_max);
            block_start = block_end;
        }
        scalers
    }

    fn quantize_element(value: f32, scaler: f32) -> u8 {
        if scaler == 0.0 {
            ZERO_INDEX
        } else {
            quantize_value(value / scaler)
        }
    }
}

impl Quantizer for ReferenceQuantizer {
    fn quantize(&self, tensor: &Tensor) -> crate::Result<QuantizedTensor> {
        let input = prepare_input(tensor, &self.config)?;
        let block_size = self.config.block_size;
        let scalers = self.scalers(&input.data);

        let mut packed = vec![0u8; input.data.len() / 2];
        for (i, &scaler) in scalers.iter().enumerate() {
            let block_start = i * block_size;
            for j in (0..block_size).step_by(2) {
                let first = Self::quantize_element(input.data[block_start + j], scaler);
                let second = Self::quantize_element(input.data[block_start + j + 1], scaler);
                packed[(block_start + j) / 2] = pack_nibbles(first, second);
            }
        }

        Ok(QuantizedTensor::new(
            packed,
            encode_scales(scalers, &self.config)?,
            input.shape,
            input.dtype,
            block_size,
        ))
    }

    fn dequantize(&self, quantized: &QuantizedTensor) -> crate::Result<Tensor> {
        quantized.validate()?;
        let block_size = quantized.block_size;
        let scalers = quantized.scales.values();

        let mut output = vec![0.0f32; quantized.numel()];
        for (i, &scaler) in scalers.iter().enumerate() {
            let block_start = i * block_size;
            for j in (0..block_size).step_by(2) {
                let (first, second) = unpack_nibbles(quantized.data[(block_start + j) / 2]);
                output[block_start + j] = dequantize_value(first) * scaler;
                output[block_start + j + 1] = dequantize_value(second) * scaler;
            }
        }

        restore_tensor(output, quantized)
    }
}
