//! Piece availability bitmaps.
//!
//! Bits are stored most-significant-bit first within each byte, matching the
//! BITFIELD wire message: piece `i` is bit `7 - i % 8` of byte `i / 8`.

use super::{PieceIndex, TorrentError};

/// One bit per piece; a set bit means "have".
///
/// Spare bits past `piece_count` in the final byte are always zero, so
/// the raw bytes can be sent on the wire or persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bytes: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Builds a bitfield from raw bytes, padding or truncating to size.
    ///
    /// Used for persisted sidecar data, where a short or stale file must
    /// not prevent startup. Spare bits are cleared.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut field = Self::new(piece_count);
        let len = field.bytes.len().min(bytes.len());
        field.bytes[..len].copy_from_slice(&bytes[..len]);
        field.clear_spare_bits();
        field
    }

    /// Builds a bitfield from a BITFIELD message payload.
    ///
    /// # Errors
    ///
    /// - `TorrentError::DecodeError` - If the payload is not exactly `ceil(piece_count / 8)` bytes
    pub fn from_wire(bytes: &[u8], piece_count: usize) -> Result<Self, TorrentError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::DecodeError {
                message: format!(
                    "Bitfield is {} bytes, expected {expected} for {piece_count} pieces",
                    bytes.len()
                ),
            });
        }
        Ok(Self::from_bytes(bytes, piece_count))
    }

    /// Returns true if the bit for `index` is set. Out-of-range is false.
    pub fn has(&self, index: PieceIndex) -> bool {
        let i = index.as_usize();
        if i >= self.piece_count {
            return false;
        }
        self.bytes[i / 8] & Self::mask(i) != 0
    }

    /// Sets the bit for `index`. Returns false if it was already set.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolError` - If `index` is outside the torrent
    pub fn set(&mut self, index: PieceIndex) -> Result<bool, TorrentError> {
        let i = self.check_index(index)?;
        let was_set = self.bytes[i / 8] & Self::mask(i) != 0;
        self.bytes[i / 8] |= Self::mask(i);
        Ok(!was_set)
    }

    /// Clears the bit for `index`. Out-of-range indices are ignored.
    pub fn clear(&mut self, index: PieceIndex) {
        let i = index.as_usize();
        if i < self.piece_count {
            self.bytes[i / 8] &= !Self::mask(i);
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True when every piece is present.
    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.piece_count
    }

    /// Number of pieces this bitfield describes.
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Raw MSB-first bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Iterates over the indices of set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .filter(|&i| self.bytes[i / 8] & Self::mask(i) != 0)
            .map(|i| PieceIndex::new(i as u32))
    }

    fn check_index(&self, index: PieceIndex) -> Result<usize, TorrentError> {
        let i = index.as_usize();
        if i >= self.piece_count {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Piece index {index} out of range for {} pieces",
                    self.piece_count
                ),
            });
        }
        Ok(i)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bytes.len() * 8 - self.piece_count;
        if spare > 0
            && let Some(last) = self.bytes.last_mut()
        {
            *last &= 0xFFu8 << spare;
        }
    }

    fn mask(i: usize) -> u8 {
        1 << (7 - (i % 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_layout() {
        let mut field = Bitfield::new(10);
        field.set(PieceIndex::new(0)).unwrap();
        field.set(PieceIndex::new(9)).unwrap();

        assert_eq!(field.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert!(field.has(PieceIndex::new(0)));
        assert!(field.has(PieceIndex::new(9)));
        assert!(!field.has(PieceIndex::new(1)));
        assert_eq!(field.count_ones(), 2);
    }

    #[test]
    fn test_set_reports_new_bits_only() {
        let mut field = Bitfield::new(4);
        assert!(field.set(PieceIndex::new(2)).unwrap());
        assert!(!field.set(PieceIndex::new(2)).unwrap());
        assert!(field.set(PieceIndex::new(4)).is_err());
    }

    #[test]
    fn test_spare_bits_are_ignored() {
        // Piece count 10 leaves six spare bits in the second byte
        let field = Bitfield::from_bytes(&[0xFF, 0xFF], 10);
        assert_eq!(field.as_bytes(), &[0xFF, 0b1100_0000]);
        assert_eq!(field.count_ones(), 10);
        assert!(field.is_complete());
        assert!(!field.has(PieceIndex::new(10)));
    }

    #[test]
    fn test_from_bytes_pads_short_input() {
        let field = Bitfield::from_bytes(&[0b0010_0000], 12);
        assert_eq!(field.as_bytes().len(), 2);
        assert_eq!(field.iter_set().collect::<Vec<_>>(), vec![PieceIndex::new(2)]);
    }

    #[test]
    fn test_from_wire_rejects_wrong_length() {
        assert!(Bitfield::from_wire(&[0xFF], 9).is_err());
        assert!(Bitfield::from_wire(&[0xFF, 0x80], 9).is_ok());
        assert!(Bitfield::from_wire(&[0, 0, 0], 9).is_err());
    }

    #[test]
    fn test_clear() {
        let mut field = Bitfield::from_bytes(&[0xF0], 8);
        field.clear(PieceIndex::new(1));
        field.clear(PieceIndex::new(100));
        assert_eq!(field.as_bytes(), &[0b1011_0000]);
    }
}
