//! Torrent content layout: files, piece length and expected digests

use std::path::PathBuf;

use super::{PieceDigest, PieceIndex, SlotIndex};

/// One file of a torrent, relative to the save path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

/// Portion of a byte range that falls inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Errors raised when torrent metadata cannot describe a valid layout.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("Piece length must be greater than zero")]
    ZeroPieceLength,

    #[error("Torrent has no content")]
    EmptyTorrent,

    #[error("Expected {expected} piece hashes, got {actual}")]
    PieceCountMismatch { expected: u32, actual: usize },
}

/// Immutable description of a torrent's content.
///
/// Owned by the torrent and shared with its piece manager. Pieces are laid
/// out back to back over the concatenation of all files; only the last piece
/// may be shorter than `piece_length`.
#[derive(Debug, Clone)]
pub struct TorrentLayout {
    name: String,
    piece_length: u32,
    total_length: u64,
    files: Vec<FileEntry>,
    file_offsets: Vec<u64>,
    piece_hashes: Vec<PieceDigest>,
}

impl TorrentLayout {
    /// Builds a layout, checking the digest count against the content size.
    ///
    /// # Errors
    ///
    /// - `LayoutError::ZeroPieceLength` - If `piece_length` is zero
    /// - `LayoutError::EmptyTorrent` - If the files hold no bytes
    /// - `LayoutError::PieceCountMismatch` - If digests don't cover the content exactly
    pub fn new(
        name: impl Into<String>,
        piece_length: u32,
        files: Vec<FileEntry>,
        piece_hashes: Vec<PieceDigest>,
    ) -> Result<Self, LayoutError> {
        if piece_length == 0 {
            return Err(LayoutError::ZeroPieceLength);
        }

        let mut file_offsets = Vec::with_capacity(files.len());
        let mut total_length = 0u64;
        for file in &files {
            file_offsets.push(total_length);
            total_length += file.length;
        }

        if total_length == 0 {
            return Err(LayoutError::EmptyTorrent);
        }

        let expected = total_length.div_ceil(u64::from(piece_length)) as u32;
        if piece_hashes.len() != expected as usize {
            return Err(LayoutError::PieceCountMismatch {
                expected,
                actual: piece_hashes.len(),
            });
        }

        Ok(Self {
            name: name.into(),
            piece_length,
            total_length,
            files,
            file_offsets,
            piece_hashes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Size in bytes of `piece`; the last piece may be short.
    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        let start = u64::from(piece.as_u32()) * u64::from(self.piece_length);
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Size in bytes of the storage region behind `slot`.
    pub fn slot_size(&self, slot: SlotIndex) -> u32 {
        self.piece_size(slot.home_piece())
    }

    /// True when the final piece is shorter than `piece_length`.
    pub fn has_short_last_piece(&self) -> bool {
        self.last_piece_size() < self.piece_length
    }

    pub fn last_piece(&self) -> PieceIndex {
        PieceIndex::new(self.num_pieces() - 1)
    }

    pub fn last_piece_size(&self) -> u32 {
        self.piece_size(self.last_piece())
    }

    /// Expected digest of `piece`, if the index is in range.
    pub fn expected_digest(&self, piece: PieceIndex) -> Option<&PieceDigest> {
        self.piece_hashes.get(piece.as_usize())
    }

    /// Absolute offset of `slot` + `offset` in the concatenated content.
    pub fn slot_offset(&self, slot: SlotIndex, offset: u32) -> u64 {
        u64::from(slot.as_u32()) * u64::from(self.piece_length) + u64::from(offset)
    }

    /// Index of the file holding absolute content offset `offset`.
    ///
    /// Zero-length files never hold a byte and are skipped.
    pub fn file_at_offset(&self, offset: u64) -> Option<usize> {
        if offset >= self.total_length {
            return None;
        }
        let candidate = self.file_offsets.partition_point(|&start| start <= offset);
        (0..candidate)
            .rev()
            .find(|&index| self.files[index].length > 0)
    }

    /// Splits the absolute range `offset..offset + length` into per-file slices.
    ///
    /// Bytes past the end of the content are not covered by any slice.
    pub fn file_slices(&self, offset: u64, length: u64) -> Vec<FileSlice> {
        let mut slices = Vec::new();
        let end = (offset + length).min(self.total_length);
        let mut position = offset;

        let Some(mut file_index) = self.file_at_offset(position) else {
            return slices;
        };

        while position < end && file_index < self.files.len() {
            let file_start = self.file_offsets[file_index];
            let file_end = file_start + self.files[file_index].length;
            if file_end > position {
                let slice_end = file_end.min(end);
                slices.push(FileSlice {
                    file_index,
                    file_offset: position - file_start,
                    length: slice_end - position,
                });
                position = slice_end;
            }
            file_index += 1;
        }

        slices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests(count: usize) -> Vec<PieceDigest> {
        (0..count).map(|i| PieceDigest::of(&[i as u8])).collect()
    }

    fn multi_file_layout() -> TorrentLayout {
        // 10 + 0 + 25 + 5 = 40 bytes, 16-byte pieces -> 3 pieces, last is 8 bytes
        TorrentLayout::new(
            "multi",
            16,
            vec![
                FileEntry::new("a.bin", 10),
                FileEntry::new("empty.bin", 0),
                FileEntry::new("dir/b.bin", 25),
                FileEntry::new("c.bin", 5),
            ],
            digests(3),
        )
        .unwrap()
    }

    #[test]
    fn test_piece_sizes() {
        let layout = multi_file_layout();
        assert_eq!(layout.num_pieces(), 3);
        assert_eq!(layout.piece_size(PieceIndex::new(0)), 16);
        assert_eq!(layout.piece_size(PieceIndex::new(2)), 8);
        assert!(layout.has_short_last_piece());
        assert_eq!(layout.slot_size(SlotIndex::new(2)), 8);
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        let result = TorrentLayout::new("bad", 16, vec![FileEntry::new("a", 40)], digests(2));
        assert!(matches!(
            result,
            Err(LayoutError::PieceCountMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_empty_torrent_rejected() {
        let result = TorrentLayout::new("bad", 16, vec![FileEntry::new("a", 0)], Vec::new());
        assert!(matches!(result, Err(LayoutError::EmptyTorrent)));
    }

    #[test]
    fn test_file_at_offset_skips_empty_files() {
        let layout = multi_file_layout();
        assert_eq!(layout.file_at_offset(0), Some(0));
        assert_eq!(layout.file_at_offset(9), Some(0));
        assert_eq!(layout.file_at_offset(10), Some(2));
        assert_eq!(layout.file_at_offset(35), Some(3));
        assert_eq!(layout.file_at_offset(40), None);
    }

    #[test]
    fn test_file_slices_span_files() {
        let layout = multi_file_layout();
        let slices = layout.file_slices(layout.slot_offset(SlotIndex::new(0), 0), 16);
        assert_eq!(
            slices,
            vec![
                FileSlice {
                    file_index: 0,
                    file_offset: 0,
                    length: 10
                },
                FileSlice {
                    file_index: 2,
                    file_offset: 0,
                    length: 6
                },
            ]
        );

        let slices = layout.file_slices(layout.slot_offset(SlotIndex::new(2), 0), 16);
        assert_eq!(
            slices,
            vec![
                FileSlice {
                    file_index: 2,
                    file_offset: 22,
                    length: 3
                },
                FileSlice {
                    file_index: 3,
                    file_offset: 0,
                    length: 5
                },
            ]
        );
    }
}
