//! Fixed-width perceptual hash bit vectors.
//!
//! Bits are packed MSB-first in row-major order, so bit 0 of the hash is the
//! top bit of the first byte. Prefixes and bands are read from that end.

mod dhash;
mod pool;

pub use dhash::{DHasher, HashError, ImageHasher};
pub use pool::HashPool;
pub(crate) use pool::panic_message;

use serde::{Serialize, Serializer};
use std::fmt;

/// Fixed-length bit vector produced by a perceptual hash.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HashBits {
    len: u32,
    bytes: Vec<u8>,
}

impl HashBits {
    /// Pack a sequence of bits (first bit = most significant).
    pub fn from_bits<I: IntoIterator<Item = bool>>(bits: I) -> Self {
        let mut bytes = Vec::new();
        let mut len = 0u32;
        for bit in bits {
            let byte_idx = (len / 8) as usize;
            if byte_idx == bytes.len() {
                bytes.push(0);
            }
            if bit {
                bytes[byte_idx] |= 0x80 >> (len % 8);
            }
            len += 1;
        }
        Self { len, bytes }
    }

    /// Rebuild from packed bytes as stored. Returns None when the byte count
    /// does not match `len` or padding bits are set.
    pub fn from_bytes(len: u32, bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() != (len as usize).div_ceil(8) {
            return None;
        }
        let pad = (bytes.len() * 8) as u32 - len;
        if pad > 0 {
            let mask = (1u8 << pad) - 1;
            if bytes.last().is_some_and(|b| b & mask != 0) {
                return None;
            }
        }
        Some(Self { len, bytes })
    }

    /// Parse a hex string produced by [`HashBits::to_hex`].
    pub fn from_hex(len: u32, s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(len, bytes)
    }

    /// Number of bits.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Packed bytes, MSB-first.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Value of bit `i` (0 = first / most significant).
    pub fn bit(&self, i: u32) -> bool {
        debug_assert!(i < self.len);
        self.bytes[(i / 8) as usize] & (0x80 >> (i % 8)) != 0
    }

    /// Return a copy with bit `i` inverted.
    pub fn with_flipped(&self, i: u32) -> Self {
        let mut out = self.clone();
        out.bytes[(i / 8) as usize] ^= 0x80 >> (i % 8);
        out
    }

    /// Count of differing bits. Widths are expected to match; any excess
    /// length on either side counts as differing.
    pub fn hamming_distance(&self, other: &HashBits) -> u32 {
        let common: u32 = self
            .bytes
            .iter()
            .zip(&other.bytes)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        common + self.len.abs_diff(other.len)
    }

    /// `width` bits starting at bit `start`, as an integer (width <= 64).
    pub fn band(&self, start: u32, width: u32) -> u64 {
        debug_assert!(width <= 64);
        let end = (start + width).min(self.len);
        let mut value = 0u64;
        for i in start..end {
            value = (value << 1) | self.bit(i) as u64;
        }
        value
    }

    /// Top `prefix_bits` bits; the whole hash when it is narrower.
    pub fn prefix(&self, prefix_bits: u32) -> u64 {
        self.band(0, prefix_bits.min(self.len).min(64))
    }
}

impl fmt::Debug for HashBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashBits({}:{})", self.len, self.to_hex())
    }
}

impl fmt::Display for HashBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for HashBits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Number of bits in a hash of the given grid dimension.
pub fn hash_bits_for(hash_size: u32) -> u32 {
    hash_size * hash_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: u32) -> HashBits {
        HashBits::from_bits((0..len).map(|i| i % 3 == 0))
    }

    #[test]
    fn test_packing_is_msb_first() {
        let h = HashBits::from_bits([true, false, false, false, false, false, false, true, true]);
        assert_eq!(h.len(), 9);
        assert_eq!(h.as_bytes(), &[0b1000_0001, 0b1000_0000]);
        assert!(h.bit(0));
        assert!(!h.bit(1));
        assert!(h.bit(8));
    }

    #[test]
    fn test_from_bytes_rejects_bad_padding() {
        assert!(HashBits::from_bytes(9, vec![0xff, 0x80]).is_some());
        assert!(HashBits::from_bytes(9, vec![0xff, 0x81]).is_none());
        assert!(HashBits::from_bytes(16, vec![0xff]).is_none());
    }

    #[test]
    fn test_hamming_counts_flipped_bits() {
        let a = pattern(256);
        let mut b = a.clone();
        for i in [0, 7, 100, 255] {
            b = b.with_flipped(i);
        }
        assert_eq!(a.hamming_distance(&b), 4);
        assert_eq!(b.hamming_distance(&a), 4);
        assert_eq!(a.hamming_distance(&a), 0);
    }

    #[test]
    fn test_prefix_uses_whole_hash_when_narrower() {
        let h = HashBits::from_bits([true, false, true, true]);
        assert_eq!(h.prefix(16), 0b1011);
        assert_eq!(h.prefix(2), 0b10);
    }

    #[test]
    fn test_band_reads_interior_bits() {
        let h = HashBits::from_bits([false, false, true, true, false, true, false, false]);
        assert_eq!(h.band(2, 4), 0b1101);
    }

    #[test]
    fn test_hex_round_trip_keeps_length() {
        let h = pattern(100);
        let parsed = HashBits::from_hex(100, &h.to_hex()).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(h.to_hex().len(), 26);
    }
}
