//! Mapping between normalized values and NF4 indices.
//!
//! A value maps to the first codepoint that is greater than or equal to it,
//! saturating at the last index. Because the codebook is sorted this is the
//! insertion position of the value, which is also `16 - count(codepoint >= value)`.

use super::codebook::{NF4_CODEBOOK, ZERO_INDEX};

const LAST_INDEX: u8 = (NF4_CODEBOOK.len() - 1) as u8;

/// Linear scan: smallest `i` with `value <= codebook[i]`, else 15
pub fn quantize_value(value: f32) -> u8 {
    for (i, &level) in NF4_CODEBOOK.iter().enumerate() {
        if value <= level {
            return i as u8;
        }
    }
    LAST_INDEX
}

/// Branch-free form of [`quantize_value`]: compare against every codepoint and count
#[inline]
pub fn quantize_by_count(value: f32) -> u8 {
    let at_or_above: u8 = NF4_CODEBOOK.iter().map(|&level| (value <= level) as u8).sum();
    (NF4_CODEBOOK.len() as u8 - at_or_above).min(LAST_INDEX)
}

/// Codepoint for an index
#[inline]
pub fn dequantize_value(index: u8) -> f32 {
    debug_assert!(index <= LAST_INDEX, "NF4 index {} out of range", index);
    NF4_CODEBOOK[index as usize]
}

/// Normalize `block` by `scale` and write one index per element into `out`.
///
/// A zero scale only comes from an all-zero block; every element then maps to
/// the zero codepoint instead of dividing by zero.
pub fn quantize_block(block: &[f32], scale: f32, out: &mut [u8]) {
    debug_assert_eq!(block.len(), out.len());
    if scale == 0.0 {
        out.fill(ZERO_INDEX);
        return;
    }
    for (slot, &value) in out.iter_mut().zip(block) {
        *slot = quantize_by_count(value / scale);
    }
}

/// Codepoint width below `index`, i.e. the largest rounding error the
/// first-at-or-above rule can introduce for a value mapped to `index`.
pub fn gap_below(index: u8) -> f32 {
    match index {
        0 => 0.0,
        i => NF4_CODEBOOK[i as usize] - NF4_CODEBOOK[i as usize - 1],
    }
}
