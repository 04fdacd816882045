//! A compact, fixed-length bitset representing piece availability.
//!
//! On the wire, a bitfield is sent most-significant-bit first: the highest
//! bit of the first byte represents piece 0, the next highest bit piece 1,
//! and so on. `0b1100_0001` means pieces 0, 1 and 7 are set.
//!
//! Unlike indexing a raw `BitVec`, all accessors here are safe against
//! out-of-range indices: `has` returns `false` and `set`/`clear` are no-ops,
//! rather than panicking.

use bitvec::prelude::{BitVec, Msb0};

/// The underlying bit-vector representation, MSB-first, byte packed.
pub(crate) type RawBitfield = BitVec<Msb0, u8>;

/// A fixed-length (once constructed) piece-availability bitset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: RawBitfield,
}

impl Bitfield {
    /// Creates a new bitfield of `len` bits, all initially unset.
    pub fn new(len: usize) -> Self {
        Self {
            bits: RawBitfield::repeat(false, len),
        }
    }

    /// Wraps a raw, wire-format byte string as a bitfield of exactly `len`
    /// logical bits.
    ///
    /// The wire representation may be longer than `len` if the piece count
    /// isn't a multiple of 8 (the trailing padding bits must be 0, but this
    /// is not enforced here, mirroring the lenient approach most clients
    /// take for interoperability).
    pub fn from_wire_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bits = RawBitfield::from_slice(bytes);
        bits.resize(len, false);
        Self { bits }
    }

    /// Returns the wire-format byte representation (MSB-first, padded with
    /// zero bits up to the next byte boundary).
    pub fn into_wire_bytes(self) -> Vec<u8> {
        self.bits.into_vec()
    }

    /// The number of logical bits (pieces) this bitfield represents.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Returns whether piece `index` is set. Out-of-range indices return
    /// `false`.
    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Sets piece `index`. A no-op if `index` is out of range.
    pub fn set(&mut self, index: usize) {
        if let Some(mut bit) = self.bits.get_mut(index) {
            *bit = true;
        }
    }

    /// Clears piece `index`. A no-op if `index` is out of range.
    pub fn clear(&mut self, index: usize) {
        if let Some(mut bit) = self.bits.get_mut(index) {
            *bit = false;
        }
    }

    /// The number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    /// Returns true if every bit is set (i.e. the peer is a seed).
    pub fn all(&self) -> bool {
        self.bits.all()
    }

    /// Returns true if no bit is set.
    pub fn not_any(&self) -> bool {
        self.bits.not_any()
    }

    /// Resizes the bitfield to `len` bits, truncating or padding with
    /// `false` as needed.
    pub fn resize(&mut self, len: usize, value: bool) {
        self.bits.resize(len, value);
    }

    /// Iterates the indices of all set bits, in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().filter_map(|(i, b)| if *b { Some(i) } else { None })
    }
}

impl From<RawBitfield> for Bitfield {
    fn from(bits: RawBitfield) -> Self {
        Self { bits }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_is_safe() {
        let mut bf = Bitfield::new(4);
        assert!(!bf.has(100));
        bf.set(100);
        bf.clear(100);
        assert_eq!(bf.count_ones(), 0);
    }

    #[test]
    fn set_clear_roundtrip() {
        let mut bf = Bitfield::new(8);
        bf.set(0);
        bf.set(7);
        assert!(bf.has(0));
        assert!(bf.has(7));
        assert!(!bf.has(1));
        assert_eq!(bf.count_ones(), 2);
        bf.clear(0);
        assert!(!bf.has(0));
        assert_eq!(bf.count_ones(), 1);
    }

    #[test]
    fn wire_bytes_msb_first() {
        // 0b1100_0001 => pieces 0, 1, 7
        let bf = Bitfield::from_wire_bytes(&[0b1100_0001], 8);
        assert!(bf.has(0));
        assert!(bf.has(1));
        assert!(bf.has(7));
        assert!(!bf.has(2));
    }

    #[test]
    fn all_and_not_any() {
        let mut bf = Bitfield::new(3);
        assert!(bf.not_any());
        assert!(!bf.all());
        bf.set(0);
        bf.set(1);
        bf.set(2);
        assert!(bf.all());
    }
}
