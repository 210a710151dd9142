//! Per-block absolute-maximum scales.

use rayon::prelude::*;

/// Absolute maximum of a slice.
///
/// A NaN anywhere in the slice makes the result NaN; `f32::max` would drop it.
pub fn absmax(block: &[f32]) -> f32 {
    block.iter().fold(0.0f32, |acc, &x| {
        if acc.is_nan() || x.is_nan() {
            f32::NAN
        } else {
            acc.max(x.abs())
        }
    })
}

/// One absmax per contiguous block of `block_size` elements, in block order.
///
/// A trailing partial block gets its own scale.
pub fn block_absmax(data: &[f32], block_size: usize) -> Vec<f32> {
    data.chunks(block_size).map(absmax).collect()
}

/// Parallel `block_absmax`, identical output.
pub fn par_block_absmax(data: &[f32], block_size: usize) -> Vec<f32> {
    data.par_chunks(block_size).map(absmax).collect()
}
