//! Fast-resume verification
//!
//! Decides whether a persisted resume record still describes the files on
//! disk. A rejected record is not an error: the caller falls back to a full
//! check. Only failures to read file metadata are fatal.

use crate::config::DiskConfig;
use crate::storage::{RESUME_FORMAT_VERSION, ResumeData, StorageBackend, StorageError, StorageMode};
use crate::torrent::{PieceIndex, TorrentLayout};

use super::slot_table::SlotTable;

/// Outcome of checking a resume record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeVerdict {
    /// Record matches the files; its table and have set can be installed
    Accepted { table: SlotTable, have: Vec<bool> },
    /// Record cannot be trusted
    Rejected { reason: String },
}

impl ResumeVerdict {
    fn rejected(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::debug!("Rejecting resume data: {}", reason);
        ResumeVerdict::Rejected { reason }
    }
}

/// Number of slots a compact table for `layout` has under `config`.
pub(crate) fn compact_slot_count(layout: &TorrentLayout, config: &DiskConfig) -> u32 {
    config
        .compact_slot_limit
        .unwrap_or(layout.num_pieces())
        .min(layout.num_pieces())
}

/// Checks `resume` against the torrent and the files behind `backend`.
///
/// Structural checks run first so a malformed record never costs a metadata
/// scan. The backend may adopt remapped file names from the record.
///
/// # Errors
///
/// - `StorageError` - If file metadata cannot be read
pub fn verify_resume(
    layout: &TorrentLayout,
    config: &DiskConfig,
    backend: &dyn StorageBackend,
    resume: &ResumeData,
) -> Result<ResumeVerdict, StorageError> {
    if resume.format_version != RESUME_FORMAT_VERSION {
        return Ok(ResumeVerdict::rejected(format!(
            "unsupported format version {}",
            resume.format_version
        )));
    }
    if resume.num_pieces != layout.num_pieces() {
        return Ok(ResumeVerdict::rejected(format!(
            "piece count {} does not match torrent ({})",
            resume.num_pieces,
            layout.num_pieces()
        )));
    }
    if resume.piece_length != layout.piece_length() {
        return Ok(ResumeVerdict::rejected(format!(
            "piece length {} does not match torrent ({})",
            resume.piece_length,
            layout.piece_length()
        )));
    }
    if resume.storage_mode != config.storage_mode {
        return Ok(ResumeVerdict::rejected(format!(
            "recorded in {} mode, running in {} mode",
            resume.storage_mode, config.storage_mode
        )));
    }
    if resume.pieces.len() != layout.num_pieces() as usize {
        return Ok(ResumeVerdict::rejected(format!(
            "have bitfield has {} entries for {} pieces",
            resume.pieces.len(),
            layout.num_pieces()
        )));
    }
    if resume.file_sizes.len() != layout.files().len() {
        return Ok(ResumeVerdict::rejected(format!(
            "{} file entries for {} files",
            resume.file_sizes.len(),
            layout.files().len()
        )));
    }

    let table = match config.storage_mode {
        StorageMode::Full => SlotTable::full(layout.num_pieces(), layout.has_short_last_piece()),
        StorageMode::Compact => match SlotTable::from_resume_slots(
            layout.num_pieces(),
            compact_slot_count(layout, config),
            layout.has_short_last_piece(),
            &resume.slots,
        ) {
            Ok(table) => table,
            Err(error) => return Ok(ResumeVerdict::rejected(format!("invalid slot list: {error}"))),
        },
    };

    if !backend.verify_resume_data(resume)? {
        return Ok(ResumeVerdict::rejected("files changed since the record was written"));
    }

    let have = resume
        .pieces
        .iter()
        .enumerate()
        .map(|(index, &have)| have && table.lookup(PieceIndex::new(index as u32)).is_some())
        .collect();

    Ok(ResumeVerdict::Accepted { table, have })
}

/// Captures `table` and `have` as a resume record, with backend entries.
///
/// # Errors
///
/// - `StorageError` - If file metadata cannot be read
pub fn build_resume_data(
    layout: &TorrentLayout,
    table: &SlotTable,
    have: &[bool],
    backend: &dyn StorageBackend,
) -> Result<ResumeData, StorageError> {
    let mut resume = ResumeData::new(table.mode(), layout.num_pieces(), layout.piece_length());
    resume.pieces = have.to_vec();
    resume.slots = table.slots_snapshot();
    backend.write_resume_data(&mut resume)?;
    Ok(resume)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::DiscardStorage;
    use crate::storage::test_fixtures::{piece_bytes, single_file_layout, temp_file_storage};
    use crate::torrent::SlotIndex;

    fn compact_config() -> DiskConfig {
        DiskConfig::compact_for_testing()
    }

    #[test]
    fn test_round_trip_accepts_unchanged_files() {
        let (layout, content) = single_file_layout(4, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        let config = compact_config();

        let mut table = SlotTable::compact(4, 4, false);
        table.assign(SlotIndex::new(0), PieceIndex::new(2)).unwrap();
        table.assign(SlotIndex::new(1), PieceIndex::new(1)).unwrap();
        storage
            .write(SlotIndex::new(0), 0, piece_bytes(&layout, &content, PieceIndex::new(2)))
            .unwrap();
        storage
            .write(SlotIndex::new(1), 0, piece_bytes(&layout, &content, PieceIndex::new(1)))
            .unwrap();
        let have = vec![false, true, true, false];

        let resume = build_resume_data(&layout, &table, &have, storage.as_ref()).unwrap();
        let json = resume.to_json().unwrap();
        let reloaded = ResumeData::from_json(&json).unwrap();

        let verdict = verify_resume(&layout, &config, storage.as_ref(), &reloaded).unwrap();
        assert_eq!(verdict, ResumeVerdict::Accepted { table, have });
    }

    #[test]
    fn test_mode_mismatch_rejected() {
        let (layout, _content) = single_file_layout(4, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));

        let table = SlotTable::full(4, false);
        let resume = build_resume_data(&layout, &table, &[true; 4], storage.as_ref()).unwrap();

        let verdict = verify_resume(&layout, &compact_config(), storage.as_ref(), &resume).unwrap();
        assert!(matches!(verdict, ResumeVerdict::Rejected { reason } if reason.contains("full mode")));
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let (layout, _content) = single_file_layout(4, 32);
        let storage = DiscardStorage::new(Arc::clone(&layout));
        let config = DiskConfig::for_testing();

        let mut resume = ResumeData::new(StorageMode::Full, 5, 32);
        resume.file_sizes = vec![Default::default()];
        let verdict = verify_resume(&layout, &config, &storage, &resume).unwrap();
        assert!(matches!(verdict, ResumeVerdict::Rejected { .. }));

        let mut resume = ResumeData::new(StorageMode::Full, 4, 32);
        resume.file_sizes = Vec::new();
        let verdict = verify_resume(&layout, &config, &storage, &resume).unwrap();
        assert!(matches!(verdict, ResumeVerdict::Rejected { reason } if reason.contains("file entries")));

        let mut resume = ResumeData::new(StorageMode::Full, 4, 32);
        resume.format_version = 99;
        let verdict = verify_resume(&layout, &config, &storage, &resume).unwrap();
        assert!(matches!(verdict, ResumeVerdict::Rejected { reason } if reason.contains("version")));
    }

    #[test]
    fn test_invalid_slot_list_rejected() {
        let (layout, _content) = single_file_layout(3, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));

        let mut resume = ResumeData::new(StorageMode::Compact, 3, 32);
        storage.write_resume_data(&mut resume).unwrap();
        resume.slots = vec![Some(1), Some(1)];

        let verdict = verify_resume(&layout, &compact_config(), storage.as_ref(), &resume).unwrap();
        assert!(matches!(verdict, ResumeVerdict::Rejected { reason } if reason.contains("slot list")));
    }

    #[test]
    fn test_changed_file_rejected() {
        let (layout, content) = single_file_layout(3, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        let config = compact_config();

        let mut table = SlotTable::compact(3, 3, false);
        table.assign(SlotIndex::new(0), PieceIndex::new(0)).unwrap();
        storage
            .write(SlotIndex::new(0), 0, piece_bytes(&layout, &content, PieceIndex::new(0)))
            .unwrap();
        let resume = build_resume_data(&layout, &table, &[true, false, false], storage.as_ref()).unwrap();

        storage
            .write(SlotIndex::new(1), 0, piece_bytes(&layout, &content, PieceIndex::new(1)))
            .unwrap();

        let verdict = verify_resume(&layout, &config, storage.as_ref(), &resume).unwrap();
        assert!(matches!(verdict, ResumeVerdict::Rejected { .. }));
    }

    #[test]
    fn test_have_bits_of_unmapped_pieces_dropped() {
        let (layout, _content) = single_file_layout(3, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));

        let mut resume = ResumeData::new(StorageMode::Compact, 3, 32);
        storage.write_resume_data(&mut resume).unwrap();
        resume.slots = vec![Some(0)];
        resume.pieces = vec![true, true, false];

        let verdict = verify_resume(&layout, &compact_config(), storage.as_ref(), &resume).unwrap();
        match verdict {
            ResumeVerdict::Accepted { have, .. } => assert_eq!(have, vec![true, false, false]),
            other => panic!("Expected acceptance, got {other:?}"),
        }
    }
}
