//! Compact migration: move out-of-place pieces to their home slots
//!
//! Steps are planned one at a time from the current table, so writes that
//! land between steps are taken into account. Every step puts at least one
//! piece home and never displaces a piece that already is, so repeated
//! planning terminates with no piece out of place.

use crate::storage::{StorageBackend, StorageError};
use crate::torrent::{PieceIndex, SlotIndex};

use super::slot_table::{SlotState, SlotTable, TableError};

/// One relocation of slot contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStep {
    /// Copy `from` into the unused slot `to`; `from` becomes free
    Move {
        from: SlotIndex,
        to: SlotIndex,
        /// `to` has no storage reserved yet
        reserve: bool,
    },
    /// Exchange the contents of two assigned slots
    Swap { a: SlotIndex, b: SlotIndex },
    /// Contents of `a` go to `b`, `b` to `c` and `c` to `a`
    Rotate {
        a: SlotIndex,
        b: SlotIndex,
        c: SlotIndex,
    },
}

impl MigrationStep {
    /// Slots the step reads or writes.
    pub fn slots(&self) -> Vec<SlotIndex> {
        match *self {
            MigrationStep::Move { from, to, .. } => vec![from, to],
            MigrationStep::Swap { a, b } => vec![a, b],
            MigrationStep::Rotate { a, b, c } => vec![a, b, c],
        }
    }

    /// Relocates the data on disk.
    ///
    /// # Errors
    ///
    /// - `StorageError` - Whatever the backend reports
    pub fn apply_storage(&self, backend: &dyn StorageBackend) -> Result<(), StorageError> {
        match *self {
            MigrationStep::Move { from, to, reserve } => {
                if reserve {
                    backend.allocate_slot(to)?;
                }
                backend.move_slot(from, to)
            }
            MigrationStep::Swap { a, b } => backend.swap_slots(a, b),
            MigrationStep::Rotate { a, b, c } => backend.swap_slots3(a, b, c),
        }
    }

    /// Records the relocation in the table once the data has moved.
    ///
    /// # Errors
    ///
    /// - `TableError` - If the table changed since the step was planned
    pub fn apply_table(&self, table: &mut SlotTable) -> Result<(), TableError> {
        match *self {
            MigrationStep::Move { from, to, .. } => table.move_slot(from, to).map(|_| ()),
            MigrationStep::Swap { a, b } => table.swap_slots(a, b),
            MigrationStep::Rotate { a, b, c } => table.rotate_slots(a, b, c),
        }
    }

    /// Pieces whose data the step relocates.
    pub fn pieces(&self, table: &SlotTable) -> Vec<PieceIndex> {
        self.slots()
            .into_iter()
            .filter_map(|slot| table.slot_owner(slot))
            .collect()
    }
}

/// Plans the next step for the lowest out-of-place piece, if any.
pub fn plan_next_step(table: &SlotTable) -> Option<MigrationStep> {
    let (piece, current) = table.out_of_place().into_iter().next()?;
    let home = piece.home_slot();

    let step = match table.slot_state(home)? {
        SlotState::Unallocated => MigrationStep::Move {
            from: current,
            to: home,
            reserve: true,
        },
        SlotState::Unassigned => MigrationStep::Move {
            from: current,
            to: home,
            reserve: false,
        },
        SlotState::Assigned(occupant) => {
            let occupant_home = occupant.home_slot();
            match table.slot_state(occupant_home) {
                // Occupant belongs where the piece is, or has no home at all
                None => MigrationStep::Swap { a: current, b: home },
                Some(_) if occupant_home == current => MigrationStep::Swap { a: current, b: home },
                Some(SlotState::Unallocated) => MigrationStep::Move {
                    from: home,
                    to: occupant_home,
                    reserve: true,
                },
                Some(SlotState::Unassigned) => MigrationStep::Move {
                    from: home,
                    to: occupant_home,
                    reserve: false,
                },
                Some(SlotState::Assigned(_)) => MigrationStep::Rotate {
                    a: current,
                    b: home,
                    c: occupant_home,
                },
            }
        }
    };

    Some(step)
}
