//! Torrent-side identifiers and content layout
//!
//! Pieces are the logical units a torrent is verified in; slots are the
//! piece-sized regions of the concatenated file content they are stored in.

pub mod digest;
pub mod layout;

use std::fmt;

pub use digest::{PartialHash, PieceDigest};
pub use layout::{FileEntry, FileSlice, LayoutError, TorrentLayout};
use serde::{Deserialize, Serialize};

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a usize for table lookups.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Slot this piece occupies when storage is laid out in full.
    pub fn home_slot(self) -> SlotIndex {
        SlotIndex(self.0)
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of a piece-sized storage region.
///
/// Slot `n` covers bytes `n * piece_length..` of the concatenated file
/// content. With full allocation a piece always lives in the slot with the
/// same index; with compact allocation the mapping is arbitrary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub u32);

impl SlotIndex {
    /// Creates SlotIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying slot index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a usize for table lookups.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Piece whose home is this slot.
    pub fn home_piece(self) -> PieceIndex {
        PieceIndex(self.0)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A byte range within a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRequest {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

impl PieceRequest {
    pub fn new(piece: PieceIndex, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// Request covering an entire piece of `piece_size` bytes.
    pub fn whole_piece(piece: PieceIndex, piece_size: u32) -> Self {
        Self::new(piece, 0, piece_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
    }

    #[test]
    fn test_home_slot_identity() {
        let piece = PieceIndex::new(7);
        assert_eq!(piece.home_slot(), SlotIndex::new(7));
        assert_eq!(piece.home_slot().home_piece(), piece);
    }

    #[test]
    fn test_index_display() {
        assert_eq!(PieceIndex::new(42).to_string(), "42");
        assert_eq!(SlotIndex::new(3).to_string(), "3");
    }
}
