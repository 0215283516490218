//! Whole-piece read cache

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;

use crate::torrent::PieceIndex;

/// Read cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheInfo {
    pub capacity: usize,
    pub cached_pieces: usize,
    pub hits: u64,
    pub misses: u64,
}

/// LRU of complete, verified-or-not piece contents keyed by piece.
///
/// A capacity of zero disables caching; lookups then always miss.
#[derive(Debug)]
pub struct ReadCache {
    pieces: Option<LruCache<PieceIndex, Bytes>>,
    hits: u64,
    misses: u64,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            pieces: NonZeroUsize::new(capacity).map(LruCache::new),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, piece: PieceIndex) -> Option<Bytes> {
        let found = self
            .pieces
            .as_mut()
            .and_then(|pieces| pieces.get(&piece).cloned());
        match found {
            Some(_) => self.hits += 1,
            None => self.misses += 1,
        }
        found
    }

    pub fn insert(&mut self, piece: PieceIndex, data: Bytes) {
        if let Some(pieces) = self.pieces.as_mut() {
            pieces.put(piece, data);
        }
    }

    pub fn invalidate(&mut self, piece: PieceIndex) {
        if let Some(pieces) = self.pieces.as_mut() {
            pieces.pop(&piece);
        }
    }

    pub fn clear(&mut self) {
        if let Some(pieces) = self.pieces.as_mut() {
            pieces.clear();
        }
    }

    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            capacity: self.pieces.as_ref().map_or(0, |pieces| pieces.cap().get()),
            cached_pieces: self.pieces.as_ref().map_or(0, LruCache::len),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction_and_stats() {
        let mut cache = ReadCache::new(2);
        cache.insert(PieceIndex::new(0), Bytes::from_static(b"zero"));
        cache.insert(PieceIndex::new(1), Bytes::from_static(b"one"));

        assert_eq!(cache.get(PieceIndex::new(0)), Some(Bytes::from_static(b"zero")));
        cache.insert(PieceIndex::new(2), Bytes::from_static(b"two"));

        // Piece 1 was least recently used
        assert_eq!(cache.get(PieceIndex::new(1)), None);
        assert!(cache.get(PieceIndex::new(2)).is_some());

        let info = cache.info();
        assert_eq!(info.capacity, 2);
        assert_eq!(info.cached_pieces, 2);
        assert_eq!(info.hits, 2);
        assert_eq!(info.misses, 1);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut cache = ReadCache::new(4);
        cache.insert(PieceIndex::new(3), Bytes::from_static(b"three"));
        cache.insert(PieceIndex::new(5), Bytes::from_static(b"five"));

        cache.invalidate(PieceIndex::new(3));
        assert_eq!(cache.get(PieceIndex::new(3)), None);

        cache.clear();
        assert_eq!(cache.info().cached_pieces, 0);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut cache = ReadCache::new(0);
        cache.insert(PieceIndex::new(0), Bytes::from_static(b"data"));

        assert_eq!(cache.get(PieceIndex::new(0)), None);
        assert_eq!(cache.info().capacity, 0);
    }
}
