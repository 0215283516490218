//! Storage backends for slot-addressed torrent data.
//!
//! Defines the capability interface the piece manager drives, the persisted
//! resume record, and the two concrete backends: `FileStorage` writes to real
//! files, `DiscardStorage` drops everything for tests and benchmarks.

pub mod discard;
pub mod file_storage;
pub mod resume_data;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
pub use discard::DiscardStorage;
pub use file_storage::FileStorage;
pub use resume_data::{FileFingerprint, RESUME_FORMAT_VERSION, ResumeData};
use serde::{Deserialize, Serialize};

use crate::config::DiskConfig;
use crate::executor::DiskExecutor;
use crate::torrent::{SlotIndex, TorrentLayout};

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Allocation strategy for a torrent's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Every piece has storage reserved at its own slot up front.
    #[default]
    Full,
    /// Slots are reserved as pieces arrive and reused freely.
    Compact,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Full => write!(f, "full"),
            StorageMode::Compact => write!(f, "compact"),
        }
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(StorageMode::Full),
            "compact" => Ok(StorageMode::Compact),
            _ => Err(format!("Invalid storage mode: {s}")),
        }
    }
}

/// Errors raised by storage backends.
///
/// Covers file system failures and out-of-range slot access.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// File system operation on a specific path failed
    #[error("I/O error on {}: {source}", path.display())]
    File {
        /// Path the operation touched
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Access extends past the end of the slot
    #[error("Range {offset}+{length} exceeds slot {slot} of {slot_size} bytes")]
    OutOfRange {
        slot: SlotIndex,
        offset: u32,
        length: usize,
        slot_size: u32,
    },

    /// File index does not exist in the torrent
    #[error("File index {index} out of range")]
    InvalidFileIndex { index: usize },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn file(path: &Path, source: std::io::Error) -> Self {
        StorageError::File {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Slot-addressed storage for one torrent.
///
/// Methods without a default body are required; the rest are optional
/// capabilities a backend may refine. All methods are blocking and are
/// invoked from disk executor jobs, never from the piece manager's own
/// thread of control.
pub trait StorageBackend: sealed::Sealed + Send + Sync {
    // Required operations.

    /// Creates directories and, with `allocate_now`, sizes every file.
    ///
    /// # Errors
    ///
    /// - `StorageError::File` - If a directory or file cannot be created
    fn initialize(&self, allocate_now: bool) -> Result<(), StorageError>;

    /// Reads `buf.len()` bytes at `offset` within `slot`.
    ///
    /// Regions never written read back as zeros.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfRange` - If the range leaves the slot
    /// - `StorageError::File` - If a file cannot be read
    fn read(&self, slot: SlotIndex, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Writes `buf` at `offset` within `slot`.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfRange` - If the range leaves the slot
    /// - `StorageError::File` - If a file cannot be opened or written
    fn write(&self, slot: SlotIndex, offset: u32, buf: &[u8]) -> Result<usize, StorageError>;

    /// Copies the content of `src` into `dst`.
    fn move_slot(&self, src: SlotIndex, dst: SlotIndex) -> Result<(), StorageError>;

    /// Exchanges the contents of `a` and `b`.
    fn swap_slots(&self, a: SlotIndex, b: SlotIndex) -> Result<(), StorageError>;

    /// Rotates contents: `a` moves to `b`, `b` to `c` and `c` to `a`.
    fn swap_slots3(&self, a: SlotIndex, b: SlotIndex, c: SlotIndex) -> Result<(), StorageError>;

    /// Absolute content offset `slot` + `offset` resolves to.
    fn physical_offset(&self, slot: SlotIndex, offset: u32) -> u64;

    /// True if any file of the torrent exists with content.
    fn has_any_file(&self) -> Result<bool, StorageError>;

    /// Closes all open file handles.
    fn release_files(&self) -> Result<(), StorageError>;

    /// Closes and removes every file of the torrent.
    fn delete_files(&self) -> Result<(), StorageError>;

    /// Renames file `index` to `new_name`, relative to the save path.
    fn rename_file(&self, index: usize, new_name: &Path) -> Result<(), StorageError>;

    /// Moves all files below `new_path` and adopts it as the save path.
    fn move_storage(&self, new_path: &Path) -> Result<(), StorageError>;

    /// Current size and modification time of every file.
    fn file_fingerprints(&self) -> Result<Vec<FileFingerprint>, StorageError>;

    /// Checks backend-specific resume entries against the files on disk.
    fn verify_resume_data(&self, resume: &ResumeData) -> Result<bool, StorageError>;

    /// Records backend-specific entries into `resume`.
    fn write_resume_data(&self, resume: &mut ResumeData) -> Result<(), StorageError>;

    // Optional operations.

    /// Vectored read; returns the total number of bytes read.
    fn readv(
        &self,
        slot: SlotIndex,
        offset: u32,
        bufs: &mut [IoSliceMut<'_>],
    ) -> Result<usize, StorageError> {
        let mut position = offset;
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let read = self.read(slot, position, buf)?;
            total += read;
            position += read as u32;
        }
        Ok(total)
    }

    /// Vectored write; returns the total number of bytes written.
    fn writev(
        &self,
        slot: SlotIndex,
        offset: u32,
        bufs: &[IoSlice<'_>],
    ) -> Result<usize, StorageError> {
        let mut position = offset;
        let mut total = 0;
        for buf in bufs {
            let written = self.write(slot, position, buf)?;
            total += written;
            position += written as u32;
        }
        Ok(total)
    }

    /// First slot at or after `slot` that holds content.
    fn sparse_end(&self, slot: SlotIndex) -> SlotIndex {
        slot
    }

    /// Advises that a read of the given range is coming.
    fn hint_read(&self, _slot: SlotIndex, _offset: u32, _length: u32) {}

    /// Reserves storage for a slot that had none.
    fn allocate_slot(&self, _slot: SlotIndex) -> Result<(), StorageError> {
        Ok(())
    }

    /// Called once file `index` is complete.
    fn finalize_file(&self, _index: usize) -> Result<(), StorageError> {
        Ok(())
    }
}

/// The closed set of storage backends a piece manager can be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    File,
    Discard,
}

impl BackendKind {
    /// Builds the backend for `layout` rooted at `save_path`.
    pub fn build(
        self,
        layout: Arc<TorrentLayout>,
        save_path: PathBuf,
        config: &DiskConfig,
    ) -> Arc<dyn StorageBackend> {
        match self {
            BackendKind::File => Arc::new(FileStorage::new(layout, save_path, config)),
            BackendKind::Discard => Arc::new(DiscardStorage::new(layout)),
        }
    }
}

/// Read/write request executed asynchronously against a backend.
#[derive(Debug, Clone)]
pub enum FileOp {
    Read {
        slot: SlotIndex,
        offset: u32,
        length: u32,
    },
    Write {
        slot: SlotIndex,
        offset: u32,
        buffers: Vec<Bytes>,
    },
}

/// Result of a completed `FileOp`.
#[derive(Debug, Clone)]
pub enum FileOpOutput {
    Read(Bytes),
    Written(usize),
}

impl FileOpOutput {
    /// Data returned by a read; empty for writes.
    pub fn into_data(self) -> Bytes {
        match self {
            FileOpOutput::Read(data) => data,
            FileOpOutput::Written(_) => Bytes::new(),
        }
    }

    pub fn bytes_transferred(&self) -> usize {
        match self {
            FileOpOutput::Read(data) => data.len(),
            FileOpOutput::Written(written) => *written,
        }
    }
}

impl FileOp {
    pub fn slot(&self) -> SlotIndex {
        match self {
            FileOp::Read { slot, .. } | FileOp::Write { slot, .. } => *slot,
        }
    }

    /// Runs the operation synchronously against `backend`.
    ///
    /// # Errors
    ///
    /// - `StorageError` - Whatever the backend reports
    pub fn perform(&self, backend: &dyn StorageBackend) -> Result<FileOpOutput, StorageError> {
        match self {
            FileOp::Read {
                slot,
                offset,
                length,
            } => {
                let mut buf = vec![0u8; *length as usize];
                let read = backend.read(*slot, *offset, &mut buf)?;
                buf.truncate(read);
                Ok(FileOpOutput::Read(Bytes::from(buf)))
            }
            FileOp::Write {
                slot,
                offset,
                buffers,
            } => {
                let slices: Vec<IoSlice<'_>> = buffers.iter().map(|b| IoSlice::new(b)).collect();
                let written = backend.writev(*slot, *offset, &slices)?;
                Ok(FileOpOutput::Written(written))
            }
        }
    }
}

/// Tracks whether a submitted `FileOp` has completed.
#[derive(Debug, Clone)]
pub struct JobHandle {
    completed: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Submits `op` to `executor`; `handler` runs exactly once with the result.
pub fn submit_file_op<F>(
    backend: Arc<dyn StorageBackend>,
    executor: &dyn DiskExecutor,
    op: FileOp,
    handler: F,
) -> JobHandle
where
    F: FnOnce(Result<FileOpOutput, StorageError>) + Send + 'static,
{
    let completed = Arc::new(AtomicBool::new(false));
    let job_completed = Arc::clone(&completed);

    executor.submit(Box::new(move || {
        let result = op.perform(backend.as_ref());
        job_completed.store(true, Ordering::Release);
        handler(result);
    }));

    JobHandle { completed }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::executor::InlineDiskExecutor;
    use crate::storage::test_fixtures::single_file_layout;

    #[test]
    fn test_storage_mode_parsing() {
        assert_eq!("full".parse::<StorageMode>(), Ok(StorageMode::Full));
        assert_eq!("Compact".parse::<StorageMode>(), Ok(StorageMode::Compact));
        assert!("sparse".parse::<StorageMode>().is_err());
        assert_eq!(StorageMode::Compact.to_string(), "compact");
    }

    #[test]
    fn test_submit_file_op_completes_once() {
        let (layout, _content) = single_file_layout(4, 16);
        let backend = BackendKind::Discard.build(layout, PathBuf::new(), &DiskConfig::default());
        let (sender, receiver) = mpsc::channel();

        let handle = submit_file_op(
            backend,
            &InlineDiskExecutor,
            FileOp::Read {
                slot: SlotIndex::new(1),
                offset: 4,
                length: 8,
            },
            move |result| sender.send(result).unwrap(),
        );

        assert!(handle.is_complete());
        match receiver.recv().unwrap().unwrap() {
            FileOpOutput::Read(data) => assert_eq!(data.len(), 8),
            other => panic!("Expected read output, got {other:?}"),
        }
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_vectored_write_through_descriptor() {
        let (layout, _content) = single_file_layout(2, 16);
        let backend = BackendKind::Discard.build(layout, PathBuf::new(), &DiskConfig::default());

        let op = FileOp::Write {
            slot: SlotIndex::new(0),
            offset: 0,
            buffers: vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")],
        };

        match op.perform(backend.as_ref()).unwrap() {
            FileOpOutput::Written(written) => assert_eq!(written, 8),
            other => panic!("Expected write output, got {other:?}"),
        }
    }
}
