//! Double quantization of block scales.
//!
//! With a block size of 64, one f32 scale per block costs half a bit per weight.
//! The scales are centered on their mean and re-quantized to signed 8-bit indices,
//! with one f32 absmax per group of `scaler_block_size` consecutive scales:
//!
//! `index = round((scale - mean) * 127 / group_absmax)`, clamped to [-127, 127]
//!
//! and `scale ≈ index / 127 * group_absmax + mean` on the way back. Rounding is
//! half away from zero; an exactly saturated value maps to ±127.

use serde::{Deserialize, Serialize};

use super::block::absmax;

/// Largest stored magnitude
pub const SCALE_LEVELS: f32 = 127.0;

/// Block scales stored as 8-bit indices plus per-group correction factors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleQuantizedScales {
    /// One signed index per block
    pub indices: Vec<i8>,
    /// One absmax of centered scales per group
    pub group_absmax: Vec<f32>,
    /// Mean of the raw scales, removed before quantizing
    pub scaler_mean: f32,
    /// Number of scales per group; the final group may be shorter
    pub scaler_block_size: usize,
}

impl DoubleQuantizedScales {
    /// Quantize a scale sequence
    pub fn quantize(scales: &[f32], scaler_block_size: usize) -> crate::Result<Self> {
        if scaler_block_size == 0 {
            return Err(crate::Nf4Error::Config(
                "scaler_block_size must be positive".to_string(),
            ));
        }

        let scaler_mean = if scales.is_empty() {
            0.0
        } else {
            (scales.iter().map(|&s| s as f64).sum::<f64>() / scales.len() as f64) as f32
        };
        let centered: Vec<f32> = scales.iter().map(|&s| s - scaler_mean).collect();

        let mut indices = Vec::with_capacity(scales.len());
        let mut group_absmax = Vec::with_capacity(scales.len().div_ceil(scaler_block_size));

        for group in centered.chunks(scaler_block_size) {
            let group_max = absmax(group);
            group_absmax.push(group_max);
            indices.extend(group.iter().map(|&c| quantize_centered(c, group_max)));
        }

        Ok(Self {
            indices,
            group_absmax,
            scaler_mean,
            scaler_block_size,
        })
    }

    /// Reconstruct the scale sequence
    pub fn dequantize(&self) -> Vec<f32> {
        self.indices
            .chunks(self.scaler_block_size)
            .zip(&self.group_absmax)
            .flat_map(|(group, &group_max)| {
                group
                    .iter()
                    .map(move |&index| index as f32 / SCALE_LEVELS * group_max + self.scaler_mean)
            })
            .collect()
    }

    /// Number of block scales represented
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn n_groups(&self) -> usize {
        self.group_absmax.len()
    }

    /// Bytes needed to store this representation
    pub fn storage_bytes(&self) -> usize {
        self.indices.len() + self.group_absmax.len() * 4 + 4
    }

    /// Check the grouping is internally consistent
    pub fn validate(&self) -> crate::Result<()> {
        if self.scaler_block_size == 0 {
            return Err(crate::Nf4Error::Shape(
                "scaler_block_size must be positive".to_string(),
            ));
        }
        let expected_groups = self.indices.len().div_ceil(self.scaler_block_size);
        if self.group_absmax.len() != expected_groups {
            return Err(crate::Nf4Error::Shape(format!(
                "{} scale indices with scaler block size {} need {} groups, found {}",
                self.indices.len(),
                self.scaler_block_size,
                expected_groups,
                self.group_absmax.len()
            )));
        }
        Ok(())
    }
}

fn quantize_centered(centered: f32, group_max: f32) -> i8 {
    if group_max == 0.0 {
        return 0;
    }
    // `as` saturates and maps NaN to 0, so a NaN group stays decodable
    (centered * SCALE_LEVELS / group_max)
        .round()
        .clamp(-SCALE_LEVELS, SCALE_LEVELS) as i8
}
