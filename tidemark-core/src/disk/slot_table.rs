//! Bidirectional piece/slot mapping with free and unallocated pools
//!
//! Pure data structure; no I/O. Every mutation keeps `piece_to_slot` and
//! `slot_to_piece` exact inverses, and the two pools together with the
//! assigned slots partition the slot space. Debug builds re-check this after
//! each mutation.

use std::collections::BTreeSet;

use crate::storage::StorageMode;
use crate::torrent::{PieceIndex, SlotIndex};

/// What a slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No storage reserved yet (compact mode only)
    Unallocated,
    /// Storage reserved, no recognized piece
    Unassigned,
    /// Holds the verified or in-progress content of a piece
    Assigned(PieceIndex),
}

/// Slot handed out by `SlotTable::allocate_slot_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub slot: SlotIndex,
    /// Slot came from the unallocated pool; the backend must reserve storage
    pub needs_reservation: bool,
}

/// Errors raised by slot table operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("No slot available for piece {piece}")]
    NoSpace { piece: PieceIndex },

    #[error("Piece {piece} out of range")]
    InvalidPiece { piece: PieceIndex },

    #[error("Slot {slot} out of range or in the wrong state")]
    InvalidSlot { slot: SlotIndex },

    #[error("Piece {piece} is not mapped to a slot")]
    UnmappedPiece { piece: PieceIndex },

    #[error("Slot {slot} already holds piece {owner}")]
    SlotOccupied { slot: SlotIndex, owner: PieceIndex },

    #[error("Piece {piece} mapped more than once")]
    DuplicatePiece { piece: PieceIndex },

    #[error("Slot {slot} is too small for piece {piece}")]
    SlotTooSmall { slot: SlotIndex, piece: PieceIndex },
}

/// The piece/slot bijection of one torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable {
    mode: StorageMode,
    num_pieces: u32,
    short_last_slot: Option<SlotIndex>,
    piece_to_slot: Vec<Option<SlotIndex>>,
    slot_to_piece: Vec<SlotState>,
    unallocated_slots: BTreeSet<SlotIndex>,
    free_slots: BTreeSet<SlotIndex>,
}

impl SlotTable {
    /// Identity table: every piece lives in its own slot.
    pub fn full(num_pieces: u32, short_last_piece: bool) -> Self {
        Self {
            mode: StorageMode::Full,
            num_pieces,
            short_last_slot: Self::short_slot(num_pieces, num_pieces, short_last_piece),
            piece_to_slot: (0..num_pieces).map(|p| Some(SlotIndex::new(p))).collect(),
            slot_to_piece: (0..num_pieces)
                .map(|p| SlotState::Assigned(PieceIndex::new(p)))
                .collect(),
            unallocated_slots: BTreeSet::new(),
            free_slots: BTreeSet::new(),
        }
    }

    /// Compact table with `num_slots` slots, none of them allocated.
    ///
    /// `num_slots` is clamped to `num_pieces`.
    pub fn compact(num_pieces: u32, num_slots: u32, short_last_piece: bool) -> Self {
        let num_slots = num_slots.min(num_pieces);
        Self {
            mode: StorageMode::Compact,
            num_pieces,
            short_last_slot: Self::short_slot(num_pieces, num_slots, short_last_piece),
            piece_to_slot: vec![None; num_pieces as usize],
            slot_to_piece: vec![SlotState::Unallocated; num_slots as usize],
            unallocated_slots: (0..num_slots).map(SlotIndex::new).collect(),
            free_slots: BTreeSet::new(),
        }
    }

    /// Empty table for `mode`; compact tables hold `compact_slots` slots.
    pub fn new(mode: StorageMode, num_pieces: u32, compact_slots: u32, short_last_piece: bool) -> Self {
        match mode {
            StorageMode::Full => Self::full(num_pieces, short_last_piece),
            StorageMode::Compact => Self::compact(num_pieces, compact_slots, short_last_piece),
        }
    }

    /// Rebuilds a compact table from a persisted slot list.
    ///
    /// Entry `n` describes slot `n`: `Some(piece)` assigned, `None` reserved
    /// but unassigned. Slots past the end of the list are unallocated.
    ///
    /// # Errors
    ///
    /// - `TableError::InvalidSlot` - If the list is longer than the slot count
    /// - `TableError::InvalidPiece` - If an entry names a piece out of range
    /// - `TableError::DuplicatePiece` - If a piece appears twice
    /// - `TableError::SlotTooSmall` - If a piece other than the last sits in a short last slot
    pub fn from_resume_slots(
        num_pieces: u32,
        num_slots: u32,
        short_last_piece: bool,
        slots: &[Option<u32>],
    ) -> Result<Self, TableError> {
        let mut table = Self::compact(num_pieces, num_slots, short_last_piece);
        if slots.len() > table.slot_to_piece.len() {
            return Err(TableError::InvalidSlot {
                slot: SlotIndex::new(slots.len() as u32 - 1),
            });
        }

        for (index, entry) in slots.iter().enumerate() {
            let slot = SlotIndex::new(index as u32);
            match entry {
                None => table.mark_unassigned(slot)?,
                Some(piece) => {
                    let piece = PieceIndex::new(*piece);
                    if piece.as_u32() >= num_pieces {
                        return Err(TableError::InvalidPiece { piece });
                    }
                    if table.piece_to_slot[piece.as_usize()].is_some() {
                        return Err(TableError::DuplicatePiece { piece });
                    }
                    table.assign(slot, piece)?;
                }
            }
        }

        Ok(table)
    }

    fn short_slot(num_pieces: u32, num_slots: u32, short_last_piece: bool) -> Option<SlotIndex> {
        let last = num_pieces.checked_sub(1)?;
        (short_last_piece && last < num_slots).then_some(SlotIndex::new(last))
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    pub fn num_slots(&self) -> u32 {
        self.slot_to_piece.len() as u32
    }

    /// Slot holding `piece`, if any.
    pub fn lookup(&self, piece: PieceIndex) -> Option<SlotIndex> {
        self.piece_to_slot.get(piece.as_usize()).copied().flatten()
    }

    /// Piece held by `slot`, if any.
    pub fn slot_owner(&self, slot: SlotIndex) -> Option<PieceIndex> {
        match self.slot_state(slot) {
            Some(SlotState::Assigned(piece)) => Some(piece),
            _ => None,
        }
    }

    pub fn slot_state(&self, slot: SlotIndex) -> Option<SlotState> {
        self.slot_to_piece.get(slot.as_usize()).copied()
    }

    /// Whether `slot` is large enough for `piece`.
    pub fn can_hold(&self, slot: SlotIndex, piece: PieceIndex) -> bool {
        self.short_last_slot != Some(slot) || piece.as_u32() + 1 == self.num_pieces
    }

    /// Number of pieces currently mapped.
    pub fn assigned_count(&self) -> usize {
        self.piece_to_slot.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns the slot for `piece`, assigning one if it has none.
    ///
    /// Compact mode prefers the piece's home slot when it is not in use, then
    /// the lowest free slot, then the lowest unallocated slot.
    ///
    /// # Errors
    ///
    /// - `TableError::InvalidPiece` - If `piece` is out of range
    /// - `TableError::NoSpace` - If no usable slot is left
    pub fn allocate_slot_for(&mut self, piece: PieceIndex) -> Result<Allocation, TableError> {
        if piece.as_u32() >= self.num_pieces {
            return Err(TableError::InvalidPiece { piece });
        }
        if let Some(slot) = self.lookup(piece) {
            return Ok(Allocation {
                slot,
                needs_reservation: false,
            });
        }

        let home = piece.home_slot();
        let slot = match self.slot_state(home) {
            Some(SlotState::Unassigned | SlotState::Unallocated) => home,
            _ => self
                .free_slots
                .iter()
                .chain(self.unallocated_slots.iter())
                .copied()
                .find(|&slot| self.can_hold(slot, piece))
                .ok_or(TableError::NoSpace { piece })?,
        };

        let needs_reservation = self.slot_state(slot) == Some(SlotState::Unallocated);
        self.assign(slot, piece)?;
        Ok(Allocation {
            slot,
            needs_reservation,
        })
    }

    /// Demotes `slot` to unassigned and returns the piece it held.
    ///
    /// No-op in full mode, where every slot permanently belongs to its piece.
    ///
    /// # Errors
    ///
    /// - `TableError::InvalidSlot` - If `slot` is out of range
    pub fn release_slot(&mut self, slot: SlotIndex) -> Result<Option<PieceIndex>, TableError> {
        let state = self
            .slot_state(slot)
            .ok_or(TableError::InvalidSlot { slot })?;
        if self.mode == StorageMode::Full {
            return Ok(None);
        }

        let SlotState::Assigned(piece) = state else {
            return Ok(None);
        };
        self.piece_to_slot[piece.as_usize()] = None;
        self.slot_to_piece[slot.as_usize()] = SlotState::Unassigned;
        self.free_slots.insert(slot);
        self.debug_check();
        Ok(Some(piece))
    }

    /// Records `piece` as stored in the unused slot `slot`.
    ///
    /// # Errors
    ///
    /// - `TableError::InvalidSlot` - If `slot` is out of range
    /// - `TableError::SlotOccupied` - If `slot` already holds a piece
    /// - `TableError::SlotTooSmall` - If `slot` is the short last slot
    pub(crate) fn assign(&mut self, slot: SlotIndex, piece: PieceIndex) -> Result<(), TableError> {
        match self.slot_state(slot) {
            None => return Err(TableError::InvalidSlot { slot }),
            Some(SlotState::Assigned(owner)) => {
                return Err(TableError::SlotOccupied { slot, owner });
            }
            Some(_) => {}
        }
        if !self.can_hold(slot, piece) {
            return Err(TableError::SlotTooSmall { slot, piece });
        }
        if self.lookup(piece).is_some() {
            return Err(TableError::DuplicatePiece { piece });
        }

        self.unallocated_slots.remove(&slot);
        self.free_slots.remove(&slot);
        self.slot_to_piece[slot.as_usize()] = SlotState::Assigned(piece);
        self.piece_to_slot[piece.as_usize()] = Some(slot);
        self.debug_check();
        Ok(())
    }

    /// Moves an unallocated slot into the free pool.
    pub(crate) fn mark_unassigned(&mut self, slot: SlotIndex) -> Result<(), TableError> {
        match self.slot_state(slot) {
            Some(SlotState::Unallocated) => {
                self.unallocated_slots.remove(&slot);
                self.free_slots.insert(slot);
                self.slot_to_piece[slot.as_usize()] = SlotState::Unassigned;
                self.debug_check();
                Ok(())
            }
            Some(SlotState::Unassigned) => Ok(()),
            _ => Err(TableError::InvalidSlot { slot }),
        }
    }

    /// Table side of moving the content of `src` into the unused slot `dst`.
    ///
    /// `src` becomes free. Returns the moved piece.
    ///
    /// # Errors
    ///
    /// - `TableError::InvalidSlot` - If `src` holds nothing or `dst` is out of range
    /// - `TableError::SlotOccupied` - If `dst` holds a piece
    /// - `TableError::SlotTooSmall` - If the piece does not fit `dst`
    pub fn move_slot(&mut self, src: SlotIndex, dst: SlotIndex) -> Result<PieceIndex, TableError> {
        let piece = self
            .slot_owner(src)
            .ok_or(TableError::InvalidSlot { slot: src })?;
        match self.slot_state(dst) {
            None => return Err(TableError::InvalidSlot { slot: dst }),
            Some(SlotState::Assigned(owner)) => {
                return Err(TableError::SlotOccupied { slot: dst, owner });
            }
            Some(_) => {}
        }
        if !self.can_hold(dst, piece) {
            return Err(TableError::SlotTooSmall { slot: dst, piece });
        }

        self.unallocated_slots.remove(&dst);
        self.free_slots.remove(&dst);
        self.free_slots.insert(src);
        self.slot_to_piece[src.as_usize()] = SlotState::Unassigned;
        self.slot_to_piece[dst.as_usize()] = SlotState::Assigned(piece);
        self.piece_to_slot[piece.as_usize()] = Some(dst);
        self.debug_check();
        Ok(piece)
    }

    /// Table side of exchanging the contents of two assigned slots.
    ///
    /// # Errors
    ///
    /// - `TableError::InvalidSlot` - If either slot holds nothing
    /// - `TableError::SlotTooSmall` - If a piece does not fit its new slot
    pub fn swap_slots(&mut self, a: SlotIndex, b: SlotIndex) -> Result<(), TableError> {
        let piece_a = self.slot_owner(a).ok_or(TableError::InvalidSlot { slot: a })?;
        let piece_b = self.slot_owner(b).ok_or(TableError::InvalidSlot { slot: b })?;
        if !self.can_hold(b, piece_a) {
            return Err(TableError::SlotTooSmall { slot: b, piece: piece_a });
        }
        if !self.can_hold(a, piece_b) {
            return Err(TableError::SlotTooSmall { slot: a, piece: piece_b });
        }

        self.slot_to_piece[a.as_usize()] = SlotState::Assigned(piece_b);
        self.slot_to_piece[b.as_usize()] = SlotState::Assigned(piece_a);
        self.piece_to_slot[piece_a.as_usize()] = Some(b);
        self.piece_to_slot[piece_b.as_usize()] = Some(a);
        self.debug_check();
        Ok(())
    }

    /// Table side of rotating contents `a` to `b`, `b` to `c` and `c` to `a`.
    ///
    /// All three slots must be assigned.
    ///
    /// # Errors
    ///
    /// - `TableError::InvalidSlot` - If a slot holds nothing or slots repeat
    /// - `TableError::SlotTooSmall` - If a piece does not fit its new slot
    pub fn rotate_slots(&mut self, a: SlotIndex, b: SlotIndex, c: SlotIndex) -> Result<(), TableError> {
        if a == b || b == c || a == c {
            return Err(TableError::InvalidSlot { slot: b });
        }
        let piece_a = self.slot_owner(a).ok_or(TableError::InvalidSlot { slot: a })?;
        let piece_b = self.slot_owner(b).ok_or(TableError::InvalidSlot { slot: b })?;
        let piece_c = self.slot_owner(c).ok_or(TableError::InvalidSlot { slot: c })?;
        for (slot, piece) in [(b, piece_a), (c, piece_b), (a, piece_c)] {
            if !self.can_hold(slot, piece) {
                return Err(TableError::SlotTooSmall { slot, piece });
            }
        }

        self.slot_to_piece[b.as_usize()] = SlotState::Assigned(piece_a);
        self.slot_to_piece[c.as_usize()] = SlotState::Assigned(piece_b);
        self.slot_to_piece[a.as_usize()] = SlotState::Assigned(piece_c);
        self.piece_to_slot[piece_a.as_usize()] = Some(b);
        self.piece_to_slot[piece_b.as_usize()] = Some(c);
        self.piece_to_slot[piece_c.as_usize()] = Some(a);
        self.debug_check();
        Ok(())
    }

    /// Pieces stored away from a home slot that exists, ascending by piece.
    pub fn out_of_place(&self) -> Vec<(PieceIndex, SlotIndex)> {
        self.piece_to_slot
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let piece = PieceIndex::new(index as u32);
                let slot = (*slot)?;
                let home = piece.home_slot();
                (slot != home && home.as_u32() < self.num_slots()).then_some((piece, slot))
            })
            .collect()
    }

    /// Persistable form of a compact table.
    ///
    /// One entry per slot up to the last allocated one. Empty in full mode.
    pub fn slots_snapshot(&self) -> Vec<Option<u32>> {
        if self.mode == StorageMode::Full {
            return Vec::new();
        }
        let end = self
            .slot_to_piece
            .iter()
            .rposition(|state| *state != SlotState::Unallocated)
            .map_or(0, |last| last + 1);

        self.slot_to_piece[..end]
            .iter()
            .map(|state| match state {
                SlotState::Assigned(piece) => Some(piece.as_u32()),
                SlotState::Unassigned | SlotState::Unallocated => None,
            })
            .collect()
    }

    /// Checks that the mappings are inverse and the pools partition the slots.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation found.
    pub fn verify_invariants(&self) -> Result<(), String> {
        if self.piece_to_slot.len() != self.num_pieces as usize {
            return Err("piece_to_slot length differs from piece count".to_string());
        }

        for (index, slot) in self.piece_to_slot.iter().enumerate() {
            let Some(slot) = slot else { continue };
            match self.slot_state(*slot) {
                Some(SlotState::Assigned(piece)) if piece.as_usize() == index => {}
                other => return Err(format!("piece {index} maps to slot {slot} holding {other:?}")),
            }
        }

        for (index, state) in self.slot_to_piece.iter().enumerate() {
            let slot = SlotIndex::new(index as u32);
            let in_free = self.free_slots.contains(&slot);
            let in_unallocated = self.unallocated_slots.contains(&slot);
            match state {
                SlotState::Assigned(piece) => {
                    if self.lookup(*piece) != Some(slot) {
                        return Err(format!("slot {slot} holds piece {piece} which maps elsewhere"));
                    }
                    if in_free || in_unallocated {
                        return Err(format!("assigned slot {slot} is also pooled"));
                    }
                }
                SlotState::Unassigned if !in_free || in_unallocated => {
                    return Err(format!("unassigned slot {slot} not in the free pool"));
                }
                SlotState::Unallocated if !in_unallocated || in_free => {
                    return Err(format!("unallocated slot {slot} not in the unallocated pool"));
                }
                _ => {}
            }
        }

        let pooled = self.free_slots.len() + self.unallocated_slots.len();
        if pooled + self.assigned_count() != self.slot_to_piece.len() {
            return Err("pools and assigned slots do not partition the slot space".to_string());
        }
        Ok(())
    }

    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        if let Err(violation) = self.verify_invariants() {
            panic!("slot table invariant violated: {violation}");
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn piece(index: u32) -> PieceIndex {
        PieceIndex::new(index)
    }

    fn slot(index: u32) -> SlotIndex {
        SlotIndex::new(index)
    }

    #[test]
    fn test_full_table_is_identity() {
        let mut table = SlotTable::full(4, false);

        assert_eq!(table.lookup(piece(2)), Some(slot(2)));
        assert_eq!(table.slot_owner(slot(3)), Some(piece(3)));
        assert_eq!(
            table.allocate_slot_for(piece(1)),
            Ok(Allocation {
                slot: slot(1),
                needs_reservation: false
            })
        );
        assert_eq!(table.release_slot(slot(1)), Ok(None));
        assert_eq!(table.lookup(piece(1)), Some(slot(1)));
        assert!(table.out_of_place().is_empty());
        assert!(table.slots_snapshot().is_empty());
    }

    #[test]
    fn test_compact_allocation_prefers_home_slot() {
        let mut table = SlotTable::compact(4, 4, false);

        let allocation = table.allocate_slot_for(piece(2)).unwrap();
        assert_eq!(allocation.slot, slot(2));
        assert!(allocation.needs_reservation);

        // Home slot 1 is taken; lowest unallocated slot is used instead
        table.assign(slot(1), piece(3)).unwrap();
        let allocation = table.allocate_slot_for(piece(1)).unwrap();
        assert_eq!(allocation.slot, slot(0));
        assert!(allocation.needs_reservation);

        // Free slots win over unallocated ones
        table.release_slot(slot(2)).unwrap();
        let allocation = table.allocate_slot_for(piece(0)).unwrap();
        assert_eq!(allocation.slot, slot(2));
        assert!(!allocation.needs_reservation);
    }

    #[test]
    fn test_compact_allocation_reuses_free_slots_first() {
        let mut table = SlotTable::compact(4, 2, false);

        assert_eq!(table.allocate_slot_for(piece(3)).unwrap().slot, slot(0));
        assert_eq!(table.allocate_slot_for(piece(2)).unwrap().slot, slot(1));
        table.release_slot(slot(0)).unwrap();

        let allocation = table.allocate_slot_for(piece(1)).unwrap();
        assert_eq!(allocation.slot, slot(0));
        assert!(!allocation.needs_reservation);
    }

    #[test]
    fn test_no_space_when_pools_exhausted() {
        let mut table = SlotTable::compact(4, 2, false);
        table.allocate_slot_for(piece(0)).unwrap();
        table.allocate_slot_for(piece(1)).unwrap();

        assert_eq!(
            table.allocate_slot_for(piece(2)),
            Err(TableError::NoSpace { piece: piece(2) })
        );
        assert_eq!(table.lookup(piece(2)), None);
    }

    #[test]
    fn test_short_last_slot_only_holds_last_piece() {
        let mut table = SlotTable::compact(3, 3, true);
        table.assign(slot(0), piece(1)).unwrap();
        table.assign(slot(1), piece(2)).unwrap();

        // Only slot 2 is left and it is short
        assert!(!table.can_hold(slot(2), piece(0)));
        assert_eq!(
            table.allocate_slot_for(piece(0)),
            Err(TableError::NoSpace { piece: piece(0) })
        );

        table.release_slot(slot(1)).unwrap();
        assert_eq!(table.allocate_slot_for(piece(2)).unwrap().slot, slot(2));
        assert_eq!(table.allocate_slot_for(piece(0)).unwrap().slot, slot(1));
    }

    #[test]
    fn test_move_swap_rotate_keep_mapping() {
        let mut table = SlotTable::compact(4, 4, false);
        table.assign(slot(0), piece(1)).unwrap();
        table.assign(slot(1), piece(2)).unwrap();
        table.assign(slot(2), piece(0)).unwrap();

        assert_eq!(table.move_slot(slot(0), slot(3)), Ok(piece(1)));
        assert_eq!(table.slot_state(slot(0)), Some(SlotState::Unassigned));
        assert_eq!(table.lookup(piece(1)), Some(slot(3)));

        table.swap_slots(slot(1), slot(2)).unwrap();
        assert_eq!(table.lookup(piece(0)), Some(slot(1)));
        assert_eq!(table.lookup(piece(2)), Some(slot(2)));

        // 1 -> 2 -> 3 -> 1
        table.rotate_slots(slot(1), slot(2), slot(3)).unwrap();
        assert_eq!(table.lookup(piece(0)), Some(slot(2)));
        assert_eq!(table.lookup(piece(2)), Some(slot(3)));
        assert_eq!(table.lookup(piece(1)), Some(slot(1)));
        table.verify_invariants().unwrap();
    }

    #[test]
    fn test_rotate_rejects_unallocated_slot() {
        let mut table = SlotTable::compact(4, 4, false);
        table.assign(slot(0), piece(1)).unwrap();
        table.assign(slot(1), piece(2)).unwrap();

        let before = table.clone();
        assert_eq!(
            table.rotate_slots(slot(0), slot(1), slot(3)),
            Err(TableError::InvalidSlot { slot: slot(3) })
        );
        assert_eq!(table, before);
    }

    #[test]
    fn test_mark_unassigned_refuses_assigned_slot() {
        let mut table = SlotTable::compact(4, 4, false);
        table.assign(slot(0), piece(2)).unwrap();

        assert!(matches!(
            table.mark_unassigned(slot(0)),
            Err(TableError::InvalidSlot { .. })
        ));
        assert_eq!(table.slot_owner(slot(0)), Some(piece(2)));

        table.mark_unassigned(slot(1)).unwrap();
        table.mark_unassigned(slot(1)).unwrap();
        assert_eq!(table.slot_state(slot(1)), Some(SlotState::Unassigned));
        assert!(table.verify_invariants().is_ok());
    }

    #[test]
    fn test_out_of_place_ignores_pieces_without_home() {
        let mut table = SlotTable::compact(6, 3, false);
        table.assign(slot(0), piece(5)).unwrap();
        table.assign(slot(1), piece(2)).unwrap();

        assert_eq!(table.out_of_place(), vec![(piece(2), slot(1))]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut table = SlotTable::compact(5, 5, true);
        table.assign(slot(0), piece(3)).unwrap();
        table.mark_unassigned(slot(1)).unwrap();
        table.assign(slot(2), piece(0)).unwrap();

        let snapshot = table.slots_snapshot();
        assert_eq!(snapshot, vec![Some(3), None, Some(0)]);

        let restored = SlotTable::from_resume_slots(5, 5, true, &snapshot).unwrap();
        assert_eq!(restored, table);
    }

    #[test]
    fn test_resume_slots_validation() {
        assert_eq!(
            SlotTable::from_resume_slots(3, 3, false, &[Some(0), Some(0)]),
            Err(TableError::DuplicatePiece { piece: piece(0) })
        );
        assert_eq!(
            SlotTable::from_resume_slots(3, 3, false, &[Some(7)]),
            Err(TableError::InvalidPiece { piece: piece(7) })
        );
        assert_eq!(
            SlotTable::from_resume_slots(3, 2, false, &[None, None, None]),
            Err(TableError::InvalidSlot { slot: slot(2) })
        );
        assert_eq!(
            SlotTable::from_resume_slots(3, 3, true, &[None, None, Some(0)]),
            Err(TableError::SlotTooSmall {
                slot: slot(2),
                piece: piece(0)
            })
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(u32),
        Release(u32),
        Move(u32, u32),
        Swap(u32, u32),
        Rotate(u32, u32, u32),
    }

    fn op_strategy(n: u32) -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..n).prop_map(Op::Allocate),
            (0..n).prop_map(Op::Release),
            (0..n, 0..n).prop_map(|(a, b)| Op::Move(a, b)),
            (0..n, 0..n).prop_map(|(a, b)| Op::Swap(a, b)),
            (0..n, 0..n, 0..n).prop_map(|(a, b, c)| Op::Rotate(a, b, c)),
        ]
    }

    proptest! {
        #[test]
        fn test_bijection_holds_under_random_operations(
            num_slots in 1u32..8,
            short_last in any::<bool>(),
            ops in prop::collection::vec(op_strategy(8), 0..64),
        ) {
            let mut table = SlotTable::compact(8, num_slots, short_last);
            for op in ops {
                let before = table.clone();
                let result = match op {
                    Op::Allocate(p) => table.allocate_slot_for(piece(p)).map(|_| ()),
                    Op::Release(s) => table.release_slot(slot(s)).map(|_| ()),
                    Op::Move(a, b) => table.move_slot(slot(a), slot(b)).map(|_| ()),
                    Op::Swap(a, b) => table.swap_slots(slot(a), slot(b)),
                    Op::Rotate(a, b, c) => table.rotate_slots(slot(a), slot(b), slot(c)),
                };
                if result.is_err() {
                    prop_assert_eq!(&table, &before);
                }
                prop_assert!(table.verify_invariants().is_ok());
            }
        }
    }
}
