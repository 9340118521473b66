//! A thread-safe set of piece indices with a wire-format view.
//!
//! The torrent's own pieces and each peer's advertised pieces are tracked
//! with this type. Readers vastly outnumber writers (the scheduler walks
//! these on every pass), so the bits sit behind a read-write lock and
//! consumers that need a consistent view across many operations take
//! a [`snapshot`](Bitmap::snapshot) instead of holding the lock.

use std::sync::RwLock;

use crate::{
    error::{Error, Result},
    Bitfield, PieceIndex,
};

/// A fixed-capacity bitset of piece indices.
pub(crate) struct Bitmap {
    /// The number of pieces this bitmap covers. Bits at or past this index
    /// are never set.
    len: usize,
    bits: RwLock<Bitfield>,
}

impl Bitmap {
    /// Creates an empty bitmap covering `len` pieces.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bits: RwLock::new(Bitfield::repeat(false, len)),
        }
    }

    /// Creates a bitmap from the wire-format bitfield bytes.
    ///
    /// The byte string must be exactly `⌈len / 8⌉` bytes; spare bits in the
    /// last byte are ignored.
    pub fn from_bitfield_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = (len + 7) / 8;
        if bytes.len() != expected {
            return Err(Error::BitfieldSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let mut bits = Bitfield::from_vec(bytes.to_vec());
        bits.truncate(len);
        Ok(Self {
            len,
            bits: RwLock::new(bits),
        })
    }

    /// The number of pieces the bitmap covers (not the number of set bits).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn set(&self, index: PieceIndex) -> Result<()> {
        if index >= self.len {
            return Err(Error::InvalidPieceIndex(index));
        }
        self.bits.write().unwrap().set(index, true);
        Ok(())
    }

    pub fn unset(&self, index: PieceIndex) -> Result<()> {
        if index >= self.len {
            return Err(Error::InvalidPieceIndex(index));
        }
        self.bits.write().unwrap().set(index, false);
        Ok(())
    }

    pub fn get(&self, index: PieceIndex) -> Result<bool> {
        if index >= self.len {
            return Err(Error::InvalidPieceIndex(index));
        }
        Ok(self.bits.read().unwrap()[index])
    }

    /// The number of set bits.
    pub fn count(&self) -> usize {
        self.bits.read().unwrap().count_ones()
    }

    /// True if every piece is set.
    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    /// True if no piece is set.
    pub fn is_empty(&self) -> bool {
        self.bits.read().unwrap().not_any()
    }

    /// Unsets all bits.
    pub fn clear(&self) {
        self.bits.write().unwrap().fill(false);
    }

    /// Sets all bits.
    pub fn fill(&self) {
        self.bits.write().unwrap().fill(true);
    }

    /// Replaces the contents with the given bitfield, which must have the
    /// bitmap's capacity.
    pub fn assign(&self, bits: Bitfield) {
        debug_assert_eq!(bits.len(), self.len);
        *self.bits.write().unwrap() = bits;
    }

    /// Returns the indices of all set bits at the time of the call.
    pub fn iter(&self) -> impl Iterator<Item = PieceIndex> {
        let indices: Vec<PieceIndex> = self.bits.read().unwrap().iter_ones().collect();
        indices.into_iter()
    }

    /// Returns a point-in-time copy of the bits. Use this for passes that
    /// would otherwise hold the read lock for long (sorting, weighting).
    pub fn snapshot(&self) -> Bitfield {
        self.bits.read().unwrap().clone()
    }

    /// Returns the big-endian byte layout used on the wire: the most
    /// significant bit of byte 0 is piece 0 and spare bits in the last byte
    /// are zero. The result is always `⌈len / 8⌉` bytes.
    pub fn bitfield_bytes(&self) -> Vec<u8> {
        let bits = self.bits.read().unwrap();
        let mut bytes = bits.as_raw_slice().to_vec();
        debug_assert_eq!(bytes.len(), (self.len + 7) / 8);
        // mask the bits past `len` in the last byte, they are not part of the
        // bitmap and must read as zero on the wire
        let spare = bytes.len() * 8 - self.len;
        if spare > 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
        bytes
    }

    pub fn or(&self, other: &Bitmap) -> Bitmap {
        self.combine(other, |a, b| a | b)
    }

    pub fn and(&self, other: &Bitmap) -> Bitmap {
        self.combine(other, |a, b| a & b)
    }

    pub fn and_not(&self, other: &Bitmap) -> Bitmap {
        self.combine(other, |a, b| a & !b)
    }

    pub fn xor(&self, other: &Bitmap) -> Bitmap {
        self.combine(other, |a, b| a ^ b)
    }

    fn combine(&self, other: &Bitmap, op: impl Fn(u8, u8) -> u8) -> Bitmap {
        debug_assert_eq!(self.len, other.len);
        let a = self.bitfield_bytes();
        let b = other.bitfield_bytes();
        let bytes: Vec<u8> = a.iter().zip(b.iter()).map(|(a, b)| op(*a, *b)).collect();
        Self::from_bitfield_bytes(&bytes, self.len)
            .expect("combined bitfields have equal length")
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitmap({}/{})", self.count(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_count() {
        let bm = Bitmap::new(10);
        assert_eq!(bm.count(), 0);
        assert!(bm.is_empty());

        bm.set(0).unwrap();
        bm.set(9).unwrap();
        assert!(bm.get(0).unwrap());
        assert!(!bm.get(1).unwrap());
        assert!(bm.get(9).unwrap());
        assert_eq!(bm.count(), 2);

        bm.unset(0).unwrap();
        assert!(!bm.get(0).unwrap());
        assert_eq!(bm.count(), 1);
    }

    #[test]
    fn test_out_of_range() {
        let bm = Bitmap::new(10);
        assert!(matches!(bm.set(10), Err(Error::InvalidPieceIndex(10))));
        assert!(matches!(bm.get(10), Err(Error::InvalidPieceIndex(10))));
        assert!(matches!(bm.unset(11), Err(Error::InvalidPieceIndex(11))));
    }

    #[test]
    fn test_fill_clear() {
        let bm = Bitmap::new(17);
        bm.fill();
        assert_eq!(bm.count(), 17);
        assert!(bm.is_complete());
        bm.clear();
        assert_eq!(bm.count(), 0);
    }

    #[test]
    fn test_iter() {
        let bm = Bitmap::new(9);
        bm.set(1).unwrap();
        bm.set(4).unwrap();
        bm.set(8).unwrap();
        let indices: Vec<_> = bm.iter().collect();
        assert_eq!(indices, vec![1, 4, 8]);
    }

    #[test]
    fn test_bitfield_bytes_layout() {
        // MSB of byte 0 is piece 0
        let bm = Bitmap::new(10);
        bm.set(0).unwrap();
        bm.set(1).unwrap();
        bm.set(7).unwrap();
        bm.set(9).unwrap();
        assert_eq!(bm.bitfield_bytes(), vec![0b1100_0001, 0b0100_0000]);
    }

    #[test]
    fn test_bitfield_roundtrip() {
        for len in [1, 7, 8, 9, 16, 17, 100] {
            let bm = Bitmap::new(len);
            for i in (0..len).step_by(3) {
                bm.set(i).unwrap();
            }
            let bytes = bm.bitfield_bytes();
            assert_eq!(bytes.len(), (len + 7) / 8);
            let back = Bitmap::from_bitfield_bytes(&bytes, len).unwrap();
            assert_eq!(back.bitfield_bytes(), bytes);
            assert_eq!(back.count(), bm.count());
        }
    }

    #[test]
    fn test_from_bitfield_bytes_wrong_len() {
        assert!(matches!(
            Bitmap::from_bitfield_bytes(&[0, 0], 17),
            Err(Error::BitfieldSizeMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_set_algebra() {
        let a = Bitmap::new(10);
        let b = Bitmap::new(10);
        a.set(1).unwrap();
        a.set(2).unwrap();
        b.set(2).unwrap();
        b.set(3).unwrap();

        let or: Vec<_> = a.or(&b).iter().collect();
        assert_eq!(or, vec![1, 2, 3]);

        let and: Vec<_> = a.and(&b).iter().collect();
        assert_eq!(and, vec![2]);

        let and_not: Vec<_> = a.and_not(&b).iter().collect();
        assert_eq!(and_not, vec![1]);

        let xor: Vec<_> = a.xor(&b).iter().collect();
        assert_eq!(xor, vec![1, 3]);
    }

    #[test]
    fn test_and_not_keeps_spare_bits_zero() {
        let a = Bitmap::new(10);
        a.fill();
        let empty = Bitmap::new(10);
        let inverted = a.and_not(&empty);
        assert_eq!(inverted.count(), 10);
        assert_eq!(inverted.bitfield_bytes(), vec![0xff, 0b1100_0000]);
    }
}
