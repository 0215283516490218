//! Test fixtures for storage testing.
//!
//! Provides deterministic torrent layouts with known content and digests,
//! and temporary on-disk storage rooted in a fresh directory.

use std::sync::Arc;

use crate::config::DiskConfig;
use crate::storage::FileStorage;
use crate::torrent::{FileEntry, PieceDigest, PieceIndex, TorrentLayout};

/// Deterministic content of `length` bytes where every piece differs.
pub fn generate_content(length: usize, piece_length: u32) -> Vec<u8> {
    (0..length)
        .map(|i| {
            let piece = (i / piece_length as usize) as u8;
            (i.wrapping_mul(31) as u8) ^ piece.wrapping_mul(97) ^ 0x5a
        })
        .collect()
}

/// Builds a layout over `files`, hashing `content` for the piece digests.
///
/// # Panics
///
/// Panics if the file lengths don't add up to a valid layout.
pub fn layout_for_content(
    piece_length: u32,
    files: Vec<FileEntry>,
    content: &[u8],
) -> Arc<TorrentLayout> {
    let hashes = content
        .chunks(piece_length as usize)
        .map(PieceDigest::of)
        .collect();
    Arc::new(TorrentLayout::new("fixture", piece_length, files, hashes).unwrap())
}

/// Single-file torrent of `num_pieces` full pieces.
pub fn single_file_layout(num_pieces: u32, piece_length: u32) -> (Arc<TorrentLayout>, Vec<u8>) {
    let length = num_pieces as usize * piece_length as usize;
    let content = generate_content(length, piece_length);
    let layout = layout_for_content(
        piece_length,
        vec![FileEntry::new("data.bin", length as u64)],
        &content,
    );
    (layout, content)
}

/// Four files (one empty, one nested) with 16-byte pieces and a short last piece.
///
/// 10 + 0 + 25 + 5 = 40 bytes: pieces of 16, 16 and 8 bytes.
pub fn multi_file_layout() -> (Arc<TorrentLayout>, Vec<u8>) {
    let files = vec![
        FileEntry::new("a.bin", 10),
        FileEntry::new("empty.bin", 0),
        FileEntry::new("dir/b.bin", 25),
        FileEntry::new("c.bin", 5),
    ];
    let content = generate_content(40, 16);
    let layout = layout_for_content(16, files, &content);
    (layout, content)
}

/// Single-file torrent whose last piece is `last_piece_size` bytes.
pub fn short_last_piece_layout(
    num_pieces: u32,
    piece_length: u32,
    last_piece_size: u32,
) -> (Arc<TorrentLayout>, Vec<u8>) {
    let length = (num_pieces as usize - 1) * piece_length as usize + last_piece_size as usize;
    let content = generate_content(length, piece_length);
    let layout = layout_for_content(
        piece_length,
        vec![FileEntry::new("data.bin", length as u64)],
        &content,
    );
    (layout, content)
}

/// Bytes of `piece` within the full torrent content.
pub fn piece_bytes<'a>(layout: &TorrentLayout, content: &'a [u8], piece: PieceIndex) -> &'a [u8] {
    let start = piece.as_usize() * layout.piece_length() as usize;
    &content[start..start + layout.piece_size(piece) as usize]
}

/// File storage for `layout` in a fresh temporary directory.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created.
pub fn temp_file_storage(layout: Arc<TorrentLayout>) -> (tempfile::TempDir, Arc<FileStorage>) {
    let temp_dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::new(
        layout,
        temp_dir.path().join("download"),
        &DiskConfig::for_testing(),
    );
    (temp_dir, Arc::new(storage))
}
