//! Full check: rebuild the slot table by hashing every slot
//!
//! Slots are visited once in ascending order. Each slot holding data is
//! hashed and matched against the torrent's expected digests; sparse ranges
//! are skipped without reading.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::storage::{StorageBackend, StorageError, StorageMode};
use crate::torrent::{PartialHash, PieceDigest, PieceIndex, SlotIndex, TorrentLayout};

use super::slot_table::SlotTable;
use super::{DiskError, DiskOperation};

/// What a full check found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub table: SlotTable,
    /// Pieces verified in place (compact: verified anywhere)
    pub have: Vec<bool>,
    /// Pieces found in a slot other than their home slot
    pub out_of_place: Vec<(PieceIndex, SlotIndex)>,
    pub slots_scanned: u32,
}

/// A full check that stopped early, with what it found up to that point.
#[derive(Debug)]
pub struct ScanFailure {
    pub report: ScanReport,
    pub error: DiskError,
}

/// Streams `length` bytes of `slot` through SHA-1 in `buf`-sized reads.
///
/// With `prefix_len`, also returns the digest of the first `prefix_len`
/// bytes, taken from the same pass.
pub(crate) fn hash_slot(
    backend: &dyn StorageBackend,
    slot: SlotIndex,
    length: usize,
    buf: &mut [u8],
    prefix_len: Option<usize>,
) -> Result<(PieceDigest, Option<PieceDigest>), StorageError> {
    backend.hint_read(slot, 0, length as u32);

    let mut hasher = PartialHash::new();
    let mut prefix = None;
    let mut offset = 0usize;

    while offset < length {
        let mut chunk = buf.len().min(length - offset);
        if let Some(boundary) = prefix_len {
            if offset < boundary && offset + chunk > boundary {
                chunk = boundary - offset;
            }
        }

        backend.read(slot, offset as u32, &mut buf[..chunk])?;
        hasher.update(&buf[..chunk]);
        offset += chunk;

        if prefix_len == Some(offset) {
            prefix = Some(hasher.clone().finalize());
        }
    }

    Ok((hasher.finalize(), prefix))
}

/// Rebuilds a slot table from slot contents.
pub struct FullCheckScanner<'a> {
    layout: &'a TorrentLayout,
    backend: &'a dyn StorageBackend,
    mode: StorageMode,
    num_slots: u32,
    block_size: usize,
    abort: &'a AtomicBool,
    digests: Option<BTreeMap<PieceDigest, Vec<PieceIndex>>>,
}

impl<'a> FullCheckScanner<'a> {
    /// Creates a scanner; compact tables get `compact_slots` slots.
    pub fn new(
        layout: &'a TorrentLayout,
        backend: &'a dyn StorageBackend,
        mode: StorageMode,
        compact_slots: u32,
        block_size: usize,
        abort: &'a AtomicBool,
    ) -> Self {
        let num_slots = match mode {
            StorageMode::Full => layout.num_pieces(),
            StorageMode::Compact => compact_slots.min(layout.num_pieces()),
        };
        Self {
            layout,
            backend,
            mode,
            num_slots,
            block_size: block_size.max(1),
            abort,
            digests: None,
        }
    }

    /// Runs the check to completion.
    ///
    /// # Errors
    ///
    /// - `DiskError::Aborted` - If the abort flag was raised between slots
    /// - `DiskError::FatalDisk` - If a slot cannot be read; later slots stay unscanned
    pub fn scan(mut self) -> Result<ScanReport, ScanFailure> {
        let num_pieces = self.layout.num_pieces();
        let mut report = ScanReport {
            table: SlotTable::new(
                self.mode,
                num_pieces,
                self.num_slots,
                self.layout.has_short_last_piece(),
            ),
            have: vec![false; num_pieces as usize],
            out_of_place: Vec::new(),
            slots_scanned: 0,
        };

        tracing::debug!(
            "Full check of {} started: {} slots, {} mode",
            self.layout.name(),
            self.num_slots,
            self.mode
        );

        let mut buf = vec![0u8; self.block_size];
        let mut slot = 0u32;

        while slot < self.num_slots {
            if self.abort.load(Ordering::Acquire) {
                tracing::debug!("Full check aborted at slot {}", slot);
                return Err(ScanFailure {
                    report,
                    error: DiskError::Aborted,
                });
            }

            let data_start = self
                .backend
                .sparse_end(SlotIndex::new(slot))
                .as_u32()
                .clamp(slot, self.num_slots);
            if data_start > slot {
                tracing::trace!("Skipping sparse slots {}..{}", slot, data_start);
                report.slots_scanned += data_start - slot;
                slot = data_start;
                continue;
            }

            let current = SlotIndex::new(slot);
            let found = match self.identify(current, &mut buf) {
                Ok(digests) => self.pick_piece(&report, current, digests),
                Err(source) => {
                    tracing::warn!("Full check read failure at slot {}: {}", slot, source);
                    return Err(ScanFailure {
                        report,
                        error: DiskError::fatal(DiskOperation::FullCheck, Some(current), source),
                    });
                }
            };

            self.record(&mut report, current, found);
            report.slots_scanned += 1;
            slot += 1;
        }

        tracing::debug!(
            "Full check of {} finished: {} pieces present, {} out of place",
            self.layout.name(),
            report.have.iter().filter(|&&have| have).count(),
            report.out_of_place.len()
        );
        Ok(report)
    }

    fn identify(
        &mut self,
        slot: SlotIndex,
        buf: &mut [u8],
    ) -> Result<(PieceDigest, Option<PieceDigest>), StorageError> {
        if self.digests.is_none() {
            let mut digests: BTreeMap<PieceDigest, Vec<PieceIndex>> = BTreeMap::new();
            for index in 0..self.layout.num_pieces() {
                let piece = PieceIndex::new(index);
                if let Some(digest) = self.layout.expected_digest(piece) {
                    digests.entry(*digest).or_default().push(piece);
                }
            }
            self.digests = Some(digests);
        }

        let slot_size = self.layout.slot_size(slot) as usize;
        let last_size = self.layout.last_piece_size() as usize;
        let prefix_len = (self.layout.has_short_last_piece() && slot_size > last_size).then_some(last_size);

        hash_slot(self.backend, slot, slot_size, buf, prefix_len)
    }

    /// Chooses which piece `slot` holds from its digests.
    ///
    /// The slot's home piece wins over other candidates with the same
    /// content; pieces already found in an earlier slot are skipped.
    fn pick_piece(
        &self,
        report: &ScanReport,
        slot: SlotIndex,
        (digest, prefix_digest): (PieceDigest, Option<PieceDigest>),
    ) -> Option<PieceIndex> {
        let candidates = self
            .digests
            .as_ref()
            .and_then(|digests| digests.get(&digest))
            .map(Vec::as_slice)
            .unwrap_or_default();

        let available = |piece: &PieceIndex| match self.mode {
            StorageMode::Full => !report.have[piece.as_usize()],
            StorageMode::Compact => {
                report.table.lookup(*piece).is_none() && report.table.can_hold(slot, *piece)
            }
        };

        let home = slot.home_piece();
        if candidates.contains(&home) && available(&home) {
            return Some(home);
        }
        if let Some(piece) = candidates.iter().copied().find(|piece| available(piece)) {
            return Some(piece);
        }

        // A short last piece stored in a full-size slot only matches on its prefix
        let last = self.layout.last_piece();
        let last_matches = prefix_digest.is_some()
            && prefix_digest.as_ref() == self.layout.expected_digest(last);
        (last_matches && available(&last)).then_some(last)
    }

    fn record(&self, report: &mut ScanReport, slot: SlotIndex, found: Option<PieceIndex>) {
        match (self.mode, found) {
            (StorageMode::Full, Some(piece)) if piece.home_slot() == slot => {
                report.have[piece.as_usize()] = true;
                report.out_of_place.retain(|(found, _)| *found != piece);
            }
            (StorageMode::Full, Some(piece)) => {
                if !report.out_of_place.iter().any(|(found, _)| *found == piece) {
                    tracing::trace!("Piece {} found out of place in slot {}", piece, slot);
                    report.out_of_place.push((piece, slot));
                }
            }
            (StorageMode::Full, None) => {}
            (StorageMode::Compact, Some(piece)) => {
                if report.table.assign(slot, piece).is_ok() {
                    report.have[piece.as_usize()] = true;
                    let home = piece.home_slot();
                    if home != slot && home.as_u32() < self.num_slots {
                        tracing::trace!("Piece {} found out of place in slot {}", piece, slot);
                        report.out_of_place.push((piece, slot));
                    }
                }
            }
            (StorageMode::Compact, None) => {
                if let Err(error) = report.table.mark_unassigned(slot) {
                    tracing::warn!("Slot {} left out of the free pool: {}", slot, error);
                }
            }
        }
    }
}
