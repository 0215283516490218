//! SHA-1 piece digests

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// SHA-1 hash of a complete piece.
///
/// Expected digests come from torrent metadata; computed digests are
/// compared against them to decide which piece, if any, a slot holds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceDigest([u8; 20]);

impl PieceDigest {
    /// Creates a digest from raw SHA-1 output.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Hashes `data` in one pass.
    pub fn of(data: &[u8]) -> Self {
        let mut hash = PartialHash::new();
        hash.update(data);
        hash.finalize()
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PieceDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PieceDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceDigest({self})")
    }
}

/// Incremental SHA-1 over a piece streamed in blocks.
///
/// Cloning captures the state mid-stream, which the full check uses to
/// produce the digest of a prefix without re-reading it.
#[derive(Clone, Default)]
pub struct PartialHash {
    hasher: Sha1,
    bytes_hashed: u64,
}

impl PartialHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_hashed += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    pub fn finalize(self) -> PieceDigest {
        PieceDigest(self.hasher.finalize().into())
    }
}
