//! Piece-to-slot mapping, integrity checking and the piece manager.
//!
//! The piece manager owns one slot table and one storage backend per
//! torrent. Everything that touches disk runs as a job on a `DiskExecutor`
//! and reports back through a completion callback; structural changes to the
//! table pass through a fence so only one runs at a time.

pub mod cache;
pub mod fence;
pub mod handle;
pub mod manager;
pub mod migrator;
pub mod resume;
pub mod scanner;
pub mod slot_table;

use std::fmt;

pub use cache::{CacheInfo, ReadCache};
pub use handle::StorageHandle;
pub use manager::{CheckOutcome, HashResult, PieceManager};
pub use migrator::{MigrationStep, plan_next_step};
pub use resume::{ResumeVerdict, build_resume_data, verify_resume};
pub use scanner::{FullCheckScanner, ScanFailure, ScanReport};
pub use slot_table::{Allocation, SlotState, SlotTable, TableError};

use crate::storage::StorageError;
use crate::torrent::{PieceIndex, SlotIndex};

/// Result type for piece manager operations.
pub type DiskResult<T> = Result<T, DiskError>;

/// Operation a disk error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOperation {
    Initialize,
    Read,
    Write,
    Hash,
    VerifyResume,
    FullCheck,
    Migrate,
    RenameFile,
    MoveStorage,
    ReleaseFiles,
    DeleteFiles,
    SaveResume,
    FinalizeFile,
}

impl fmt::Display for DiskOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiskOperation::Initialize => "initialize",
            DiskOperation::Read => "read",
            DiskOperation::Write => "write",
            DiskOperation::Hash => "hash",
            DiskOperation::VerifyResume => "verify resume data",
            DiskOperation::FullCheck => "full check",
            DiskOperation::Migrate => "migrate",
            DiskOperation::RenameFile => "rename file",
            DiskOperation::MoveStorage => "move storage",
            DiskOperation::ReleaseFiles => "release files",
            DiskOperation::DeleteFiles => "delete files",
            DiskOperation::SaveResume => "save resume data",
            DiskOperation::FinalizeFile => "finalize file",
        };
        f.write_str(name)
    }
}

fn slot_suffix(slot: &Option<SlotIndex>) -> String {
    slot.map(|slot| format!(" at slot {slot}"))
        .unwrap_or_default()
}

/// Errors reported to piece manager callers.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// Backend I/O failed; the torrent is unusable until storage recovers
    #[error("Disk {operation} failed{}: {source}", slot_suffix(.slot))]
    FatalDisk {
        operation: DiskOperation,
        slot: Option<SlotIndex>,
        #[source]
        source: StorageError,
    },

    /// Compact mode ran out of slots
    #[error("No slot available for piece {piece}")]
    NoSpace { piece: PieceIndex },

    /// Resume data cannot be trusted
    #[error("Full check required: {reason}")]
    NeedFullCheck { reason: String },

    /// Piece has no slot yet
    #[error("Piece {piece} is not mapped to a slot")]
    UnmappedPiece { piece: PieceIndex },

    /// Slot index outside the table
    #[error("Invalid slot {slot}")]
    InvalidSlot { slot: SlotIndex },

    /// Request outside the piece or for a piece that does not exist
    #[error("Invalid request for piece {piece}: offset {offset}, length {length}")]
    InvalidRequest {
        piece: PieceIndex,
        offset: u32,
        length: u32,
    },

    /// Check or migration cancelled by `abort`
    #[error("Disk check aborted")]
    Aborted,

    /// Piece manager went away before completing the request
    #[error("Piece manager shut down")]
    Shutdown,
}

impl DiskError {
    pub(crate) fn fatal(operation: DiskOperation, slot: Option<SlotIndex>, source: StorageError) -> Self {
        DiskError::FatalDisk {
            operation,
            slot,
            source,
        }
    }

    /// Status code reported for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            DiskError::NeedFullCheck { .. } => StatusCode::NeedFullCheck,
            DiskError::Aborted => StatusCode::DiskCheckAborted,
            DiskError::FatalDisk { .. }
            | DiskError::NoSpace { .. }
            | DiskError::UnmappedPiece { .. }
            | DiskError::InvalidSlot { .. }
            | DiskError::InvalidRequest { .. }
            | DiskError::Shutdown => StatusCode::FatalDiskError,
        }
    }
}

impl From<TableError> for DiskError {
    fn from(error: TableError) -> Self {
        match error {
            TableError::NoSpace { piece } => DiskError::NoSpace { piece },
            TableError::UnmappedPiece { piece } => DiskError::UnmappedPiece { piece },
            TableError::InvalidSlot { slot } | TableError::SlotOccupied { slot, .. } => {
                DiskError::InvalidSlot { slot }
            }
            TableError::InvalidPiece { piece } => DiskError::InvalidRequest {
                piece,
                offset: 0,
                length: 0,
            },
            TableError::DuplicatePiece { piece } | TableError::SlotTooSmall { piece, .. } => {
                DiskError::NeedFullCheck {
                    reason: format!("piece {piece} cannot be placed as recorded"),
                }
            }
        }
    }
}

/// Status code delivered alongside every completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    NoError,
    FatalDiskError,
    NeedFullCheck,
    DiskCheckAborted,
}

impl StatusCode {
    /// Status of a completed operation.
    pub fn of<T>(result: &DiskResult<T>) -> Self {
        match result {
            Ok(_) => StatusCode::NoError,
            Err(error) => error.status(),
        }
    }
}

/// Where a piece manager is in establishing a trusted slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    /// No check has run yet
    #[default]
    None,
    /// Hashing slots to rebuild the table
    FullCheck,
    /// Moving out-of-place pieces to their home slots
    ExpandPieces,
    /// Table trusted
    Finished,
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckState::None => write!(f, "none"),
            CheckState::FullCheck => write!(f, "full check"),
            CheckState::ExpandPieces => write!(f, "expanding pieces"),
            CheckState::Finished => write!(f, "finished"),
        }
    }
}
