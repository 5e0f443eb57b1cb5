use bytes::Bytes;

use super::error::PeerError;

/// A bitfield representing which pieces a peer has.
///
/// Each bit represents whether a piece is available (1) or not (0).
/// Bits are numbered from the high bit of the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Parses the payload of a `bitfield` message.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes with every
    /// spare bit in the last byte cleared.
    pub fn from_payload(payload: &Bytes, piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if payload.len() != expected {
            return Err(PeerError::MalformedMessage(format!(
                "bitfield of {} bytes, expected {expected}",
                payload.len()
            )));
        }

        let bf = Self {
            bits: payload.to_vec(),
            piece_count,
        };
        if bf.spare_bits_set() {
            return Err(PeerError::MalformedMessage("bitfield spare bits set".into()));
        }
        Ok(bf)
    }

    /// Returns true if the piece at the given index is available.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets the bit for the piece at the given index. Returns true if the bit
    /// was previously clear.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count || self.has(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        true
    }

    /// Clears the bit for the piece at the given index.
    pub fn clear(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        self.bits[index / 8] &= !(1 << (7 - index % 8));
    }

    /// Returns the number of pieces that are available.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if all pieces are available.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns true if no pieces are available.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the total number of pieces.
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Iterates over the indices of available pieces in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has(i))
    }

    /// Returns the raw bytes of the bitfield.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Converts the bitfield to owned bytes, ready for a `bitfield` message.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn spare_mask(&self) -> u8 {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare == 0 {
            0
        } else {
            0xFFu8 >> (8 - spare)
        }
    }

    fn spare_bits_set(&self) -> bool {
        self.bits
            .last()
            .is_some_and(|last| last & self.spare_mask() != 0)
    }

    fn clear_spare_bits(&mut self) {
        let mask = self.spare_mask();
        if let Some(last) = self.bits.last_mut() {
            *last &= !mask;
        }
    }
}
