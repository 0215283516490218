//! Storage backend that stores nothing

use std::path::Path;
use std::sync::Arc;

use super::{FileFingerprint, ResumeData, StorageBackend, StorageError, sealed};
use crate::torrent::{SlotIndex, TorrentLayout};

/// Backend that drops writes and reads back zeros.
///
/// Range checks still apply, so the piece manager's bookkeeping is exercised
/// exactly as with real files. Resume data is never accepted.
#[derive(Debug, Clone)]
pub struct DiscardStorage {
    layout: Arc<TorrentLayout>,
}

impl DiscardStorage {
    pub fn new(layout: Arc<TorrentLayout>) -> Self {
        Self { layout }
    }

    fn check_range(&self, slot: SlotIndex, offset: u32, length: usize) -> Result<(), StorageError> {
        let slot_size = if slot.as_u32() < self.layout.num_pieces() {
            self.layout.slot_size(slot)
        } else {
            0
        };
        if u64::from(offset) + length as u64 > u64::from(slot_size) {
            return Err(StorageError::OutOfRange {
                slot,
                offset,
                length,
                slot_size,
            });
        }
        Ok(())
    }
}

impl sealed::Sealed for DiscardStorage {}

impl StorageBackend for DiscardStorage {
    fn initialize(&self, _allocate_now: bool) -> Result<(), StorageError> {
        Ok(())
    }

    fn read(&self, slot: SlotIndex, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.check_range(slot, offset, buf.len())?;
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, slot: SlotIndex, offset: u32, buf: &[u8]) -> Result<usize, StorageError> {
        self.check_range(slot, offset, buf.len())?;
        Ok(buf.len())
    }

    fn move_slot(&self, _src: SlotIndex, _dst: SlotIndex) -> Result<(), StorageError> {
        Ok(())
    }

    fn swap_slots(&self, _a: SlotIndex, _b: SlotIndex) -> Result<(), StorageError> {
        Ok(())
    }

    fn swap_slots3(&self, _a: SlotIndex, _b: SlotIndex, _c: SlotIndex) -> Result<(), StorageError> {
        Ok(())
    }

    fn physical_offset(&self, slot: SlotIndex, offset: u32) -> u64 {
        self.layout.slot_offset(slot, offset)
    }

    fn has_any_file(&self) -> Result<bool, StorageError> {
        Ok(false)
    }

    fn release_files(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn delete_files(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn rename_file(&self, index: usize, _new_name: &Path) -> Result<(), StorageError> {
        if index >= self.layout.files().len() {
            return Err(StorageError::InvalidFileIndex { index });
        }
        Ok(())
    }

    fn move_storage(&self, _new_path: &Path) -> Result<(), StorageError> {
        Ok(())
    }

    fn file_fingerprints(&self) -> Result<Vec<FileFingerprint>, StorageError> {
        Ok(vec![FileFingerprint::default(); self.layout.files().len()])
    }

    fn verify_resume_data(&self, _resume: &ResumeData) -> Result<bool, StorageError> {
        Ok(false)
    }

    fn write_resume_data(&self, resume: &mut ResumeData) -> Result<(), StorageError> {
        resume.file_sizes = self.file_fingerprints()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageMode;
    use crate::storage::test_fixtures::single_file_layout;

    #[test]
    fn test_reads_return_zeros() {
        let (layout, _content) = single_file_layout(3, 32);
        let storage = DiscardStorage::new(layout);

        storage.write(SlotIndex::new(1), 0, &[7u8; 32]).unwrap();
        let mut buf = [0xaau8; 16];
        assert_eq!(storage.read(SlotIndex::new(1), 8, &mut buf).unwrap(), 16);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_range_checks_still_apply() {
        let (layout, _content) = single_file_layout(3, 32);
        let storage = DiscardStorage::new(layout);

        assert!(matches!(
            storage.write(SlotIndex::new(3), 0, &[0u8; 4]),
            Err(StorageError::OutOfRange { .. })
        ));
        assert!(matches!(
            storage.rename_file(1, Path::new("x")),
            Err(StorageError::InvalidFileIndex { index: 1 })
        ));
    }

    #[test]
    fn test_resume_data_never_accepted() {
        let (layout, _content) = single_file_layout(2, 16);
        let storage = DiscardStorage::new(layout);

        let mut resume = ResumeData::new(StorageMode::Full, 2, 16);
        storage.write_resume_data(&mut resume).unwrap();

        assert_eq!(resume.file_sizes.len(), 1);
        assert!(!storage.verify_resume_data(&resume).unwrap());
        assert!(!storage.has_any_file().unwrap());
    }
}
