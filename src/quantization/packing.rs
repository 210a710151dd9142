//! Two 4-bit indices per byte.
//!
//! Consecutive pairs share a byte: element `2k` is the high nibble and element
//! `2k + 1` the low nibble of byte `k`.

use crate::Nf4Error;

/// Pack two 4-bit values into one byte
#[inline]
pub fn pack_nibbles(high: u8, low: u8) -> u8 {
    debug_assert!(high <= 0x0F && low <= 0x0F, "nibble out of range: {} {}", high, low);
    (high << 4) | low
}

/// Unpack one byte into two 4-bit values
#[inline]
pub fn unpack_nibbles(byte: u8) -> (u8, u8) {
    (byte >> 4, byte & 0x0F)
}

/// Pack a flat index sequence into `indices.len() / 2` bytes
pub fn pack_indices(indices: &[u8]) -> crate::Result<Vec<u8>> {
    if indices.len() % 2 != 0 {
        return Err(Nf4Error::Shape(format!(
            "cannot pack an odd number of indices ({})",
            indices.len()
        )));
    }
    let mut packed = vec![0u8; indices.len() / 2];
    pack_into(indices, &mut packed);
    Ok(packed)
}

/// Pack `indices` into a preallocated `out` of exactly half the length
pub fn pack_into(indices: &[u8], out: &mut [u8]) {
    debug_assert_eq!(indices.len(), out.len() * 2);
    for (byte, pair) in out.iter_mut().zip(indices.chunks_exact(2)) {
        *byte = pack_nibbles(pair[0], pair[1]);
    }
}

/// Split packed bytes back into the flat index sequence
pub fn unpack_bytes(packed: &[u8]) -> Vec<u8> {
    let mut indices = Vec::with_capacity(packed.len() * 2);
    for &byte in packed {
        let (high, low) = unpack_nibbles(byte);
        indices.push(high);
        indices.push(low);
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_pairs_roundtrip() {
        for a in 0..16u8 {
            for b in 0..16u8 {
                assert_eq!(unpack_nibbles(pack_nibbles(a, b)), (a, b));
            }
        }
    }

    #[test]
    fn test_pair_order() {
        assert_eq!(pack_nibbles(0x0A, 0x03), 0xA3);
        let packed = pack_indices(&[1, 2, 3, 4, 15, 0]).unwrap();
        assert_eq!(packed, vec![0x12, 0x34, 0xF0]);
        assert_eq!(unpack_bytes(&packed), vec![1, 2, 3, 4, 15, 0]);
    }

    #[test]
    fn test_odd_length_rejected() {
        assert!(matches!(pack_indices(&[1, 2, 3]), Err(Nf4Error::Shape(_))));
    }
}
