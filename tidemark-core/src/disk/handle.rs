//! Async handle over the piece manager.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::cache::CacheInfo;
use super::manager::{CheckOutcome, HashResult, PieceManager};
use super::{CheckState, DiskError, DiskResult};
use crate::storage::ResumeData;
use crate::torrent::{PieceIndex, PieceRequest, SlotIndex};

type Completion<T> = Box<dyn FnOnce(DiskResult<T>) + Send>;

/// Handle for awaiting piece manager operations.
///
/// Each method starts the corresponding operation and resolves with its
/// completion. Cloning is cheap; clones drive the same manager.
#[derive(Clone)]
pub struct StorageHandle {
    manager: Arc<PieceManager>,
}

impl StorageHandle {
    pub fn new(manager: Arc<PieceManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<PieceManager> {
        &self.manager
    }

    /// Starts an operation and waits for its completion.
    ///
    /// A completion dropped without running resolves to `DiskError::Shutdown`.
    async fn call<T, S>(&self, start: S) -> DiskResult<T>
    where
        T: Send + 'static,
        S: FnOnce(&Arc<PieceManager>, Completion<T>),
    {
        let (responder, rx) = oneshot::channel();
        start(
            &self.manager,
            Box::new(move |result| {
                let _ = responder.send(result);
            }),
        );

        rx.await.map_err(|_| DiskError::Shutdown)?
    }

    /// Establishes the slot table from resume data or a full check.
    ///
    /// # Errors
    /// - `DiskError::NeedFullCheck` - Resume data rejected and automatic checks disabled
    /// - `DiskError::Aborted` - `abort` called during the check
    /// - `DiskError::FatalDisk` - File metadata or slot contents unreadable
    pub async fn check_fastresume(&self, resume: Option<ResumeData>) -> DiskResult<CheckOutcome> {
        self.call(|manager, done| manager.check_fastresume(resume, done))
            .await
    }

    /// Rebuilds the slot table by hashing every slot.
    ///
    /// # Errors
    /// - `DiskError::Aborted` - `abort` called during the check
    /// - `DiskError::FatalDisk` - A slot could not be read
    pub async fn check_files(&self) -> DiskResult<CheckOutcome> {
        self.call(|manager, done| manager.check_files(done)).await
    }

    /// Reads a range of a mapped piece.
    ///
    /// # Errors
    /// - `DiskError::InvalidRequest` - Empty range or range outside the piece
    /// - `DiskError::UnmappedPiece` - Piece has no slot
    /// - `DiskError::FatalDisk` - Backend read failed
    pub async fn read(&self, request: PieceRequest) -> DiskResult<Bytes> {
        self.call(|manager, done| manager.read(request, done)).await
    }

    /// Reads and verifies the whole piece, returning the requested range.
    pub async fn read_and_hash(&self, request: PieceRequest) -> DiskResult<(Bytes, HashResult)> {
        self.call(|manager, done| manager.read_and_hash(request, done))
            .await
    }

    /// Writes `data` into `piece` at `offset`.
    ///
    /// # Errors
    /// - `DiskError::InvalidRequest` - Empty data or data outside the piece
    /// - `DiskError::NoSpace` - Compact mode ran out of slots
    /// - `DiskError::FatalDisk` - Backend write failed
    pub async fn write(&self, piece: PieceIndex, offset: u32, data: Bytes) -> DiskResult<usize> {
        self.call(|manager, done| manager.write(piece, offset, data, done))
            .await
    }

    pub async fn hash_piece(&self, piece: PieceIndex) -> DiskResult<HashResult> {
        self.call(|manager, done| manager.hash_piece(piece, done))
            .await
    }

    pub async fn cache_piece(&self, piece: PieceIndex) -> DiskResult<()> {
        self.call(|manager, done| manager.cache_piece(piece, done))
            .await
    }

    pub async fn mark_failed(&self, piece: PieceIndex) -> DiskResult<()> {
        self.call(|manager, done| manager.mark_failed(piece, done))
            .await
    }

    /// Moves out-of-place pieces home; resolves with the number of steps.
    pub async fn migrate(&self) -> DiskResult<u32> {
        self.call(|manager, done| manager.migrate(done)).await
    }

    pub async fn rename_file(&self, index: usize, new_name: PathBuf) -> DiskResult<()> {
        self.call(|manager, done| manager.rename_file(index, new_name, done))
            .await
    }

    pub async fn move_storage(&self, new_path: PathBuf) -> DiskResult<()> {
        self.call(|manager, done| manager.move_storage(new_path, done))
            .await
    }

    pub async fn release_files(&self) -> DiskResult<()> {
        self.call(|manager, done| manager.release_files(done)).await
    }

    pub async fn delete_files(&self) -> DiskResult<()> {
        self.call(|manager, done| manager.delete_files(done)).await
    }

    pub async fn save_resume_data(&self) -> DiskResult<ResumeData> {
        self.call(|manager, done| manager.save_resume_data(done))
            .await
    }

    pub async fn get_cache_info(&self) -> DiskResult<CacheInfo> {
        self.call(|manager, done| manager.get_cache_info(done))
            .await
    }

    pub async fn finalize_file(&self, index: usize) -> DiskResult<()> {
        self.call(|manager, done| manager.finalize_file(index, done))
            .await
    }

    pub fn abort(&self) {
        self.manager.abort();
    }

    pub fn check_state(&self) -> CheckState {
        self.manager.check_state()
    }

    pub fn have_pieces(&self) -> Vec<bool> {
        self.manager.have_pieces()
    }

    pub fn slot_for(&self, piece: PieceIndex) -> Option<SlotIndex> {
        self.manager.slot_for(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use crate::executor::{DiskExecutor, DiskJob, TokioDiskExecutor};
    use crate::storage::test_fixtures::{piece_bytes, single_file_layout};
    use crate::storage::{BackendKind, StorageBackend};

    /// Loses every job it is given.
    struct DroppingExecutor;

    impl DiskExecutor for DroppingExecutor {
        fn submit(&self, job: DiskJob) {
            drop(job);
        }
    }

    #[tokio::test]
    async fn test_download_and_verify_through_handle() {
        let (layout, content) = single_file_layout(4, 32);
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = PieceManager::open(
            Arc::clone(&layout),
            temp_dir.path().join("download"),
            BackendKind::File,
            Arc::new(TokioDiskExecutor::current()),
            DiskConfig::for_testing(),
        );
        let handle = StorageHandle::new(manager);

        let outcome = handle.check_fastresume(None).await.unwrap();
        assert_eq!(outcome.num_have(), 0);

        for index in 0..4 {
            let piece = PieceIndex::new(index);
            let data = Bytes::copy_from_slice(piece_bytes(&layout, &content, piece));
            handle.write(piece, 0, data).await.unwrap();
            assert!(handle.hash_piece(piece).await.unwrap().valid);
        }

        assert_eq!(handle.have_pieces(), vec![true; 4]);
        let data = handle
            .read(PieceRequest::new(PieceIndex::new(3), 16, 16))
            .await
            .unwrap();
        assert_eq!(&data[..], &piece_bytes(&layout, &content, PieceIndex::new(3))[16..]);
        assert_eq!(handle.check_state(), CheckState::Finished);
    }

    #[tokio::test]
    async fn test_dropped_completion_reports_shutdown() {
        let (layout, _content) = single_file_layout(2, 16);
        let backend: Arc<dyn StorageBackend> =
            BackendKind::Discard.build(Arc::clone(&layout), PathBuf::new(), &DiskConfig::default());
        let manager = PieceManager::new(layout, backend, Arc::new(DroppingExecutor), DiskConfig::default());
        let handle = StorageHandle::new(manager);

        let result = handle.read(PieceRequest::new(PieceIndex::new(0), 0, 8)).await;

        assert!(matches!(result, Err(DiskError::Shutdown)));
    }

    #[tokio::test]
    async fn test_errors_pass_through_handle() {
        let (layout, _content) = single_file_layout(2, 16);
        let manager = PieceManager::open(
            layout,
            PathBuf::new(),
            BackendKind::Discard,
            Arc::new(TokioDiskExecutor::current()),
            DiskConfig::compact_for_testing(),
        );
        let handle = StorageHandle::new(manager);

        let result = handle.read(PieceRequest::new(PieceIndex::new(1), 0, 8)).await;
        assert!(matches!(result, Err(DiskError::UnmappedPiece { .. })));
        assert_eq!(handle.migrate().await.unwrap(), 0);
        assert_eq!(handle.get_cache_info().await.unwrap().cached_pieces, 0);
    }
}
