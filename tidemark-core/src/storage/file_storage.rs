//! File-based storage implementation

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use super::{FileFingerprint, ResumeData, StorageBackend, StorageError, StorageMode, sealed};
use crate::config::DiskConfig;
use crate::torrent::{FileSlice, SlotIndex, TorrentLayout};

struct OpenFile {
    file: Arc<File>,
    writable: bool,
}

/// File system storage for one torrent.
///
/// Slots are mapped onto the torrent's files through the layout, so a slot
/// may span several files and a file may hold many slots. Open handles are
/// kept in a small LRU pool.
pub struct FileStorage {
    layout: Arc<TorrentLayout>,
    save_path: RwLock<PathBuf>,
    file_names: RwLock<Vec<PathBuf>>,
    handles: Mutex<LruCache<usize, OpenFile>>,
    mtime_tolerance_secs: i64,
}

impl FileStorage {
    /// Creates storage for `layout` with files below `save_path`.
    pub fn new(layout: Arc<TorrentLayout>, save_path: PathBuf, config: &DiskConfig) -> Self {
        let file_names = layout.files().iter().map(|f| f.path.clone()).collect();
        let capacity = NonZeroUsize::new(config.file_handle_limit).unwrap_or(NonZeroUsize::MIN);

        Self {
            layout,
            save_path: RwLock::new(save_path),
            file_names: RwLock::new(file_names),
            handles: Mutex::new(LruCache::new(capacity)),
            mtime_tolerance_secs: config.mtime_tolerance.as_secs() as i64,
        }
    }

    /// Directory the torrent's files live under.
    pub fn save_path(&self) -> PathBuf {
        self.save_path.read().clone()
    }

    /// Current on-disk path of file `index`.
    pub fn file_path(&self, index: usize) -> Option<PathBuf> {
        let names = self.file_names.read();
        names.get(index).map(|name| self.save_path.read().join(name))
    }

    fn path_of(&self, index: usize) -> Result<PathBuf, StorageError> {
        self.file_path(index)
            .ok_or(StorageError::InvalidFileIndex { index })
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

    fn slices(&self, slot: SlotIndex, offset: u32, length: usize) -> Vec<FileSlice> {
        self.layout
            .file_slices(self.layout.slot_offset(slot, offset), length as u64)
    }

    /// Opens file `index`, reusing a pooled handle when it allows the access.
    ///
    /// Read access to a file that does not exist yet yields `None`.
    fn open_file(&self, index: usize, writable: bool) -> Result<Option<Arc<File>>, StorageError> {
        {
            let mut handles = self.handles.lock();
            if let Some(open) = handles.get(&index) {
                if open.writable || !writable {
                    return Ok(Some(Arc::clone(&open.file)));
                }
            }
        }

        let path = self.path_of(index)?;
        let file = if writable {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| StorageError::file(parent, e))?;
            }
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| StorageError::file(&path, e))?
        } else {
            match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(StorageError::file(&path, e)),
            }
        };

        let file = Arc::new(file);
        self.handles.lock().put(
            index,
            OpenFile {
                file: Arc::clone(&file),
                writable,
            },
        );
        Ok(Some(file))
    }

    fn evict_handle(&self, index: usize) -> Option<OpenFile> {
        self.handles.lock().pop(&index)
    }

    fn slot_has_data(&self, slot: SlotIndex) -> bool {
        let length = self.layout.slot_size(slot) as usize;
        self.slices(slot, 0, length).iter().any(|slice| {
            self.file_path(slice.file_index)
                .and_then(|path| fs::metadata(path).ok())
                .is_some_and(|meta| meta.len() > slice.file_offset)
        })
    }

    fn fingerprint(path: &Path) -> Result<FileFingerprint, StorageError> {
        match fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .map(|time| DateTime::<Utc>::from(time).timestamp())
                    .unwrap_or(0);
                Ok(FileFingerprint {
                    size: meta.len(),
                    mtime,
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(FileFingerprint::default()),
            Err(e) => Err(StorageError::file(path, e)),
        }
    }

    fn fingerprints_match(&self, mode: StorageMode, recorded: &[FileFingerprint]) -> Result<bool, StorageError> {
        let current = self.file_fingerprints()?;
        if current.len() != recorded.len() {
            tracing::debug!(
                "Resume data lists {} files, torrent has {}",
                recorded.len(),
                current.len()
            );
            return Ok(false);
        }

        for (index, (expected, actual)) in recorded.iter().zip(&current).enumerate() {
            let size_ok = match mode {
                StorageMode::Compact => actual.size == expected.size,
                StorageMode::Full => actual.size >= expected.size,
            };
            if !size_ok {
                tracing::debug!(
                    "File {} size mismatch: recorded {}, found {}",
                    index,
                    expected.size,
                    actual.size
                );
                return Ok(false);
            }

            if expected.mtime != 0
                && (actual.mtime - expected.mtime).abs() > self.mtime_tolerance_secs
            {
                tracing::debug!(
                    "File {} timestamp mismatch: recorded {}, found {}",
                    index,
                    expected.mtime,
                    actual.mtime
                );
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn copy_slot(&self, slot: SlotIndex, buf: &mut [u8]) -> Result<(), StorageError> {
        self.read(slot, 0, buf).map(|_| ())
    }

    fn scratch_len(&self, slots: &[SlotIndex]) -> usize {
        slots
            .iter()
            .map(|&slot| self.layout.slot_size(slot))
            .min()
            .unwrap_or(0) as usize
    }

    fn move_file(from: &Path, to: &Path) -> Result<(), StorageError> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::file(parent, e))?;
        }
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                fs::copy(from, to).map_err(|e| StorageError::file(to, e))?;
                fs::remove_file(from).map_err(|e| StorageError::file(from, e))
            }
            Err(e) => Err(StorageError::file(from, e)),
        }
    }

    /// Moves files back to where they came from, newest first.
    ///
    /// Returns how many could not be restored; each is logged.
    fn roll_back_moves(moved: &[(PathBuf, PathBuf)]) -> usize {
        let mut stranded = 0;
        for (from, to) in moved.iter().rev() {
            if let Err(error) = Self::move_file(to, from) {
                tracing::warn!(
                    "Could not move {} back to {}: {}",
                    to.display(),
                    from.display(),
                    error
                );
                stranded += 1;
            }
        }
        stranded
    }
}

impl sealed::Sealed for FileStorage {}

impl StorageBackend for FileStorage {
    fn initialize(&self, allocate_now: bool) -> Result<(), StorageError> {
        let save_path = self.save_path();
        fs::create_dir_all(&save_path).map_err(|e| StorageError::file(&save_path, e))?;

        for (index, entry) in self.layout.files().iter().enumerate() {
            if !allocate_now && entry.length > 0 {
                continue;
            }
            let Some(file) = self.open_file(index, true)? else {
                continue;
            };
            let path = self.path_of(index)?;
            let current = file
                .metadata()
                .map_err(|e| StorageError::file(&path, e))?
                .len();
            if current < entry.length {
                file.set_len(entry.length)
                    .map_err(|e| StorageError::file(&path, e))?;
            }
        }

        tracing::debug!(
            "Initialized storage for {} at {} (allocate_now={})",
            self.layout.name(),
            save_path.display(),
            allocate_now
        );
        Ok(())
    }

    fn read(&self, slot: SlotIndex, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.check_range(slot, offset, buf.len())?;

        let mut position = 0usize;
        for slice in self.slices(slot, offset, buf.len()) {
            let dst = &mut buf[position..position + slice.length as usize];
            position += slice.length as usize;

            let Some(file) = self.open_file(slice.file_index, false)? else {
                dst.fill(0);
                continue;
            };

            let mut done = 0usize;
            while done < dst.len() {
                match file.read_at(&mut dst[done..], slice.file_offset + done as u64) {
                    Ok(0) => break,
                    Ok(read) => done += read,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let path = self.path_of(slice.file_index)?;
                        return Err(StorageError::file(&path, e));
                    }
                }
            }
            dst[done..].fill(0);
        }

        Ok(buf.len())
    }

    fn write(&self, slot: SlotIndex, offset: u32, buf: &[u8]) -> Result<usize, StorageError> {
        self.check_range(slot, offset, buf.len())?;

        let mut position = 0usize;
        for slice in self.slices(slot, offset, buf.len()) {
            let src = &buf[position..position + slice.length as usize];
            position += slice.length as usize;

            let path = self.path_of(slice.file_index)?;
            let Some(file) = self.open_file(slice.file_index, true)? else {
                continue;
            };
            file.write_all_at(src, slice.file_offset)
                .map_err(|e| StorageError::file(&path, e))?;
        }

        Ok(buf.len())
    }

    fn move_slot(&self, src: SlotIndex, dst: SlotIndex) -> Result<(), StorageError> {
        let mut scratch = vec![0u8; self.scratch_len(&[src, dst])];
        self.copy_slot(src, &mut scratch)?;
        self.write(dst, 0, &scratch)?;
        Ok(())
    }

    fn swap_slots(&self, a: SlotIndex, b: SlotIndex) -> Result<(), StorageError> {
        let len = self.scratch_len(&[a, b]);
        let mut scratch_a = vec![0u8; len];
        let mut scratch_b = vec![0u8; len];
        self.copy_slot(a, &mut scratch_a)?;
        self.copy_slot(b, &mut scratch_b)?;
        self.write(a, 0, &scratch_b)?;
        self.write(b, 0, &scratch_a)?;
        Ok(())
    }

    fn swap_slots3(&self, a: SlotIndex, b: SlotIndex, c: SlotIndex) -> Result<(), StorageError> {
        let len = self.scratch_len(&[a, b, c]);
        let mut scratch1 = vec![0u8; len];
        let mut scratch2 = vec![0u8; len];

        self.copy_slot(a, &mut scratch1)?;
        self.copy_slot(b, &mut scratch2)?;
        self.write(b, 0, &scratch1)?;
        self.copy_slot(c, &mut scratch1)?;
        self.write(c, 0, &scratch2)?;
        self.write(a, 0, &scratch1)?;
        Ok(())
    }

    fn physical_offset(&self, slot: SlotIndex, offset: u32) -> u64 {
        self.layout
            .slot_offset(slot, offset)
            .min(self.layout.total_length())
    }

    fn has_any_file(&self) -> Result<bool, StorageError> {
        for index in 0..self.layout.files().len() {
            let path = self.path_of(index)?;
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() > 0 => return Ok(true),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::file(&path, e)),
            }
        }
        Ok(false)
    }

    fn release_files(&self) -> Result<(), StorageError> {
        self.handles.lock().clear();
        Ok(())
    }

    fn delete_files(&self) -> Result<(), StorageError> {
        self.release_files()?;

        let save_path = self.save_path();
        let mut first_error = None;
        let mut directories = Vec::new();

        for index in 0..self.layout.files().len() {
            let path = self.path_of(index)?;
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound && first_error.is_none() {
                    first_error = Some(StorageError::file(&path, e));
                }
            }
            let mut parent = path.parent();
            while let Some(dir) = parent {
                if dir == save_path || !dir.starts_with(&save_path) {
                    break;
                }
                directories.push(dir.to_path_buf());
                parent = dir.parent();
            }
        }

        // Deepest first so nested directories empty out before their parents.
        directories.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        directories.dedup();
        for dir in directories {
            let _ = fs::remove_dir(&dir);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn rename_file(&self, index: usize, new_name: &Path) -> Result<(), StorageError> {
        let old_path = self.path_of(index)?;
        let new_path = self.save_path().join(new_name);

        self.evict_handle(index);
        if old_path.exists() {
            Self::move_file(&old_path, &new_path)?;
        }

        self.file_names.write()[index] = new_name.to_path_buf();
        tracing::debug!(
            "Renamed file {} from {} to {}",
            index,
            old_path.display(),
            new_path.display()
        );
        Ok(())
    }

    fn move_storage(&self, new_path: &Path) -> Result<(), StorageError> {
        self.release_files()?;

        let old_save_path = self.save_path();
        fs::create_dir_all(new_path).map_err(|e| StorageError::file(new_path, e))?;

        let names = self.file_names.read().clone();
        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();

        for name in &names {
            let from = old_save_path.join(name);
            if !from.exists() {
                continue;
            }
            let to = new_path.join(name);
            if let Err(error) = Self::move_file(&from, &to) {
                Self::roll_back_moves(&moved);
                return Err(error);
            }
            moved.push((from, to));
        }

        *self.save_path.write() = new_path.to_path_buf();
        tracing::debug!(
            "Moved {} files from {} to {}",
            moved.len(),
            old_save_path.display(),
            new_path.display()
        );
        Ok(())
    }

    fn file_fingerprints(&self) -> Result<Vec<FileFingerprint>, StorageError> {
        (0..self.layout.files().len())
            .map(|index| Self::fingerprint(&self.path_of(index)?))
            .collect()
    }

    fn verify_resume_data(&self, resume: &ResumeData) -> Result<bool, StorageError> {
        if let Some(mapped) = &resume.mapped_files {
            if mapped.len() != self.layout.files().len() {
                tracing::debug!(
                    "Resume data maps {} files, torrent has {}",
                    mapped.len(),
                    self.layout.files().len()
                );
                return Ok(false);
            }
            *self.file_names.write() = mapped.clone();
        }

        self.fingerprints_match(resume.storage_mode, &resume.file_sizes)
    }

    fn write_resume_data(&self, resume: &mut ResumeData) -> Result<(), StorageError> {
        resume.file_sizes = self.file_fingerprints()?;

        let names = self.file_names.read();
        let renamed = names
            .iter()
            .zip(self.layout.files())
            .any(|(name, entry)| *name != entry.path);
        resume.mapped_files = renamed.then(|| names.clone());
        Ok(())
    }

    fn sparse_end(&self, slot: SlotIndex) -> SlotIndex {
        (slot.as_u32()..self.layout.num_pieces())
            .map(SlotIndex::new)
            .find(|&candidate| self.slot_has_data(candidate))
            .unwrap_or(SlotIndex::new(self.layout.num_pieces()))
    }

    fn allocate_slot(&self, slot: SlotIndex) -> Result<(), StorageError> {
        let length = self.layout.slot_size(slot) as usize;
        for slice in self.slices(slot, 0, length) {
            let path = self.path_of(slice.file_index)?;
            let Some(file) = self.open_file(slice.file_index, true)? else {
                continue;
            };
            let needed = slice.file_offset + slice.length;
            let current = file
                .metadata()
                .map_err(|e| StorageError::file(&path, e))?
                .len();
            if current < needed {
                file.set_len(needed)
                    .map_err(|e| StorageError::file(&path, e))?;
            }
        }
        Ok(())
    }

    fn finalize_file(&self, index: usize) -> Result<(), StorageError> {
        let path = self.path_of(index)?;
        if let Some(open) = self.evict_handle(index) {
            if open.writable {
                open.file
                    .sync_all()
                    .map_err(|e| StorageError::file(&path, e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::storage::test_fixtures::{
        multi_file_layout, piece_bytes, single_file_layout, temp_file_storage,
    };
    use crate::torrent::PieceIndex;

    #[test]
    fn test_write_read_roundtrip_across_files() {
        let (layout, content) = multi_file_layout();
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));

        for piece in 0..layout.num_pieces() {
            let piece = PieceIndex::new(piece);
            let data = piece_bytes(&layout, &content, piece);
            storage.write(piece.home_slot(), 0, data).unwrap();
        }

        for piece in 0..layout.num_pieces() {
            let piece = PieceIndex::new(piece);
            let mut buf = vec![0u8; layout.piece_size(piece) as usize];
            storage.read(piece.home_slot(), 0, &mut buf).unwrap();
            assert_eq!(buf, piece_bytes(&layout, &content, piece));
        }

        let file_path = storage.file_path(0).unwrap();
        assert_eq!(
            fs::metadata(file_path).unwrap().len(),
            layout.files()[0].length
        );
    }

    #[test]
    fn test_read_unwritten_region_is_zeroed() {
        let (layout, _content) = single_file_layout(4, 64);
        let (_temp_dir, storage) = temp_file_storage(layout);

        let mut buf = vec![0xffu8; 32];
        let read = storage.read(SlotIndex::new(2), 16, &mut buf).unwrap();

        assert_eq!(read, 32);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let (layout, _content) = single_file_layout(2, 64);
        let (_temp_dir, storage) = temp_file_storage(layout);

        let result = storage.write(SlotIndex::new(1), 60, &[0u8; 8]);
        assert!(matches!(
            result,
            Err(StorageError::OutOfRange { slot_size: 64, .. })
        ));

        let mut buf = [0u8; 4];
        let result = storage.read(SlotIndex::new(5), 0, &mut buf);
        assert!(matches!(result, Err(StorageError::OutOfRange { .. })));
    }

    #[test]
    fn test_swap_and_rotate_slots() {
        let (layout, content) = single_file_layout(3, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        for piece in 0..3 {
            let piece = PieceIndex::new(piece);
            storage
                .write(piece.home_slot(), 0, piece_bytes(&layout, &content, piece))
                .unwrap();
        }

        let slot = SlotIndex::new;
        storage.swap_slots(slot(0), slot(1)).unwrap();
        let mut buf = vec![0u8; 32];
        storage.read(slot(0), 0, &mut buf).unwrap();
        assert_eq!(buf, piece_bytes(&layout, &content, PieceIndex::new(1)));

        // 0 holds piece 1, 1 holds piece 0, 2 holds piece 2
        storage.swap_slots3(slot(0), slot(1), slot(2)).unwrap();
        storage.read(slot(1), 0, &mut buf).unwrap();
        assert_eq!(buf, piece_bytes(&layout, &content, PieceIndex::new(1)));
        storage.read(slot(2), 0, &mut buf).unwrap();
        assert_eq!(buf, piece_bytes(&layout, &content, PieceIndex::new(0)));
        storage.read(slot(0), 0, &mut buf).unwrap();
        assert_eq!(buf, piece_bytes(&layout, &content, PieceIndex::new(2)));
    }

    #[test]
    fn test_move_slot_into_short_last_slot() {
        let (layout, content) = multi_file_layout();
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        let last = layout.last_piece();
        let last_bytes = piece_bytes(&layout, &content, last);

        storage.write(SlotIndex::new(0), 0, last_bytes).unwrap();
        storage.move_slot(SlotIndex::new(0), last.home_slot()).unwrap();

        let mut buf = vec![0u8; last_bytes.len()];
        storage.read(last.home_slot(), 0, &mut buf).unwrap();
        assert_eq!(buf, last_bytes);
    }

    #[test]
    fn test_initialize_allocates_full_sizes() {
        let (layout, _content) = multi_file_layout();
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));

        storage.initialize(true).unwrap();

        for (index, entry) in layout.files().iter().enumerate() {
            let meta = fs::metadata(storage.file_path(index).unwrap()).unwrap();
            assert_eq!(meta.len(), entry.length);
        }
        assert!(storage.has_any_file().unwrap());
    }

    #[test]
    fn test_initialize_without_allocation_creates_only_empty_files() {
        let (layout, _content) = multi_file_layout();
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));

        storage.initialize(false).unwrap();

        assert!(!storage.has_any_file().unwrap());
        assert!(!storage.file_path(0).unwrap().exists());
    }

    #[test]
    fn test_sparse_end_skips_unwritten_slots() {
        let (layout, content) = single_file_layout(6, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));

        assert_eq!(storage.sparse_end(SlotIndex::new(0)), SlotIndex::new(6));

        storage
            .write(
                SlotIndex::new(3),
                0,
                piece_bytes(&layout, &content, PieceIndex::new(3)),
            )
            .unwrap();

        // Writing slot 3 extends the file over slots 0..3 as well
        assert_eq!(storage.sparse_end(SlotIndex::new(0)), SlotIndex::new(0));
        assert_eq!(storage.sparse_end(SlotIndex::new(4)), SlotIndex::new(6));
    }

    #[test]
    fn test_allocate_slot_extends_file() {
        let (layout, _content) = single_file_layout(4, 32);
        let (_temp_dir, storage) = temp_file_storage(layout);

        storage.allocate_slot(SlotIndex::new(1)).unwrap();

        let meta = fs::metadata(storage.file_path(0).unwrap()).unwrap();
        assert_eq!(meta.len(), 64);
        assert_eq!(storage.sparse_end(SlotIndex::new(2)), SlotIndex::new(4));
    }

    #[test]
    fn test_rename_file_is_recorded_in_resume_data() {
        let (layout, content) = multi_file_layout();
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        storage
            .write(
                SlotIndex::new(0),
                0,
                piece_bytes(&layout, &content, PieceIndex::new(0)),
            )
            .unwrap();

        storage.rename_file(0, Path::new("renamed/a.bin")).unwrap();

        let renamed_path = storage.file_path(0).unwrap();
        assert!(renamed_path.ends_with("renamed/a.bin"));
        assert!(renamed_path.exists());

        let mut resume = ResumeData::new(StorageMode::Full, layout.num_pieces(), 16);
        storage.write_resume_data(&mut resume).unwrap();
        let mapped = resume.mapped_files.clone().unwrap();
        assert_eq!(mapped[0], PathBuf::from("renamed/a.bin"));

        // A fresh storage picks the mapping up from the resume record
        let fresh = FileStorage::new(
            Arc::clone(&layout),
            storage.save_path(),
            &DiskConfig::default(),
        );
        assert!(fresh.verify_resume_data(&resume).unwrap());
        assert_eq!(fresh.file_path(0).unwrap(), renamed_path);
    }

    #[test]
    fn test_verify_resume_data_detects_size_change() {
        let (layout, content) = single_file_layout(2, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        storage
            .write(
                SlotIndex::new(0),
                0,
                piece_bytes(&layout, &content, PieceIndex::new(0)),
            )
            .unwrap();

        let mut resume = ResumeData::new(StorageMode::Compact, 2, 32);
        storage.write_resume_data(&mut resume).unwrap();
        assert!(storage.verify_resume_data(&resume).unwrap());

        storage
            .write(
                SlotIndex::new(1),
                0,
                piece_bytes(&layout, &content, PieceIndex::new(1)),
            )
            .unwrap();
        assert!(!storage.verify_resume_data(&resume).unwrap());

        // Full mode tolerates files that grew
        resume.storage_mode = StorageMode::Full;
        resume.file_sizes[0].mtime = 0;
        assert!(storage.verify_resume_data(&resume).unwrap());
    }

    #[test]
    fn test_verify_resume_data_detects_timestamp_change() {
        let (layout, content) = single_file_layout(2, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        storage
            .write(
                SlotIndex::new(0),
                0,
                piece_bytes(&layout, &content, PieceIndex::new(0)),
            )
            .unwrap();

        let mut resume = ResumeData::new(StorageMode::Full, 2, 32);
        storage.write_resume_data(&mut resume).unwrap();
        resume.file_sizes[0].mtime -= 3600;

        assert!(!storage.verify_resume_data(&resume).unwrap());
    }

    #[test]
    fn test_move_storage_moves_files() {
        let (layout, content) = multi_file_layout();
        let (temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        for piece in 0..layout.num_pieces() {
            let piece = PieceIndex::new(piece);
            storage
                .write(piece.home_slot(), 0, piece_bytes(&layout, &content, piece))
                .unwrap();
        }

        let new_root = temp_dir.path().join("moved");
        storage.move_storage(&new_root).unwrap();

        assert_eq!(storage.save_path(), new_root);
        let mut buf = vec![0u8; layout.piece_size(PieceIndex::new(1)) as usize];
        storage.read(SlotIndex::new(1), 0, &mut buf).unwrap();
        assert_eq!(buf, piece_bytes(&layout, &content, PieceIndex::new(1)));
        assert!(new_root.join("dir/b.bin").exists());
    }

    #[test]
    fn test_move_storage_failure_rolls_back() {
        let (layout, content) = multi_file_layout();
        let (temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        for piece in 0..layout.num_pieces() {
            let piece = PieceIndex::new(piece);
            storage
                .write(piece.home_slot(), 0, piece_bytes(&layout, &content, piece))
                .unwrap();
        }
        let original_root = storage.save_path();

        // "dir" exists as a read-only directory at the destination, so the
        // second file cannot be moved into it.
        let new_root = temp_dir.path().join("blocked");
        let blocked_dir = new_root.join("dir");
        fs::create_dir_all(&blocked_dir).unwrap();
        fs::set_permissions(&blocked_dir, fs::Permissions::from_mode(0o555)).unwrap();

        let result = storage.move_storage(&new_root);

        fs::set_permissions(&blocked_dir, fs::Permissions::from_mode(0o755)).unwrap();
        if result.is_ok() {
            // Running with privileges that ignore permissions
            return;
        }
        assert_eq!(storage.save_path(), original_root);
        assert!(original_root.join("a.bin").exists());
        assert!(!new_root.join("a.bin").exists());
    }

    #[test]
    fn test_rollback_reports_files_it_cannot_restore() {
        let temp_dir = tempfile::tempdir().unwrap();
        let old_root = temp_dir.path().join("old");
        let new_root = temp_dir.path().join("new");
        fs::create_dir_all(&new_root).unwrap();
        fs::write(new_root.join("a.bin"), b"abc").unwrap();

        let moved = vec![
            (old_root.join("a.bin"), new_root.join("a.bin")),
            // Already gone from the destination
            (old_root.join("b.bin"), new_root.join("b.bin")),
        ];

        assert_eq!(FileStorage::roll_back_moves(&moved), 1);
        assert_eq!(fs::read(old_root.join("a.bin")).unwrap(), b"abc");
        assert!(!new_root.join("a.bin").exists());
    }

    #[test]
    fn test_delete_files_removes_everything() {
        let (layout, content) = multi_file_layout();
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        storage.initialize(true).unwrap();
        storage
            .write(
                SlotIndex::new(0),
                0,
                piece_bytes(&layout, &content, PieceIndex::new(0)),
            )
            .unwrap();

        storage.delete_files().unwrap();

        for index in 0..layout.files().len() {
            assert!(!storage.file_path(index).unwrap().exists());
        }
        assert!(!storage.save_path().join("dir").exists());
        assert!(!storage.has_any_file().unwrap());
    }

    #[test]
    fn test_finalize_file_releases_handle() {
        let (layout, content) = single_file_layout(2, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        storage
            .write(
                SlotIndex::new(0),
                0,
                piece_bytes(&layout, &content, PieceIndex::new(0)),
            )
            .unwrap();
        assert_eq!(storage.handles.lock().len(), 1);

        storage.finalize_file(0).unwrap();

        assert_eq!(storage.handles.lock().len(), 0);
        assert!(matches!(
            storage.finalize_file(9),
            Err(StorageError::InvalidFileIndex { index: 9 })
        ));
    }
}
