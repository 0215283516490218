//! Full-mode lifecycle: download, restart from resume data, rename, move
//! and delete.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tempfile::TempDir;
use tidemark_core::storage::test_fixtures::{multi_file_layout, piece_bytes};
use tidemark_core::{
    BackendKind, CheckState, DiskConfig, DiskError, PieceIndex, PieceManager, PieceRequest,
    ResumeData, StorageHandle, TokioDiskExecutor, TorrentLayout,
};
use tokio_test::{assert_err, assert_ok};

fn open_handle(layout: &Arc<TorrentLayout>, save_path: &Path) -> StorageHandle {
    StorageHandle::new(PieceManager::open(
        Arc::clone(layout),
        save_path.to_path_buf(),
        BackendKind::File,
        Arc::new(TokioDiskExecutor::current()),
        DiskConfig::for_testing(),
    ))
}

async fn download_all(handle: &StorageHandle, layout: &TorrentLayout, content: &[u8]) {
    let writes = (0..layout.num_pieces()).map(|index| {
        let piece = PieceIndex::new(index);
        let data = Bytes::copy_from_slice(piece_bytes(layout, content, piece));
        handle.write(piece, 0, data)
    });
    for written in join_all(writes).await {
        assert_ok!(written);
    }

    for index in 0..layout.num_pieces() {
        let hash = assert_ok!(handle.hash_piece(PieceIndex::new(index)).await);
        assert!(hash.valid, "piece {index} failed verification");
    }
}

#[tokio::test]
async fn test_completed_download_resumes_without_full_check() {
    let (layout, content) = multi_file_layout();
    let temp_dir = TempDir::new().unwrap();
    let save_path = temp_dir.path().join("download");

    let handle = open_handle(&layout, &save_path);
    assert_ok!(handle.check_fastresume(None).await);
    download_all(&handle, &layout, &content).await;
    let json = assert_ok!(handle.save_resume_data().await).to_json().unwrap();
    assert_ok!(handle.release_files().await);
    drop(handle);

    let reopened = open_handle(&layout, &save_path);
    let resume = ResumeData::from_json(&json).unwrap();
    let outcome = assert_ok!(reopened.check_fastresume(Some(resume)).await);

    assert!(!outcome.full_check);
    assert_eq!(outcome.have, vec![true; 3]);
    assert_eq!(reopened.check_state(), CheckState::Finished);

    // Last piece is short and spans the nested file and the trailing one
    let last = PieceIndex::new(2);
    let data = assert_ok!(reopened.read(PieceRequest::whole_piece(last, 8)).await);
    assert_eq!(&data[..], &content[32..40]);
}

#[tokio::test]
async fn test_modified_file_falls_back_to_full_check() {
    let (layout, content) = multi_file_layout();
    let temp_dir = TempDir::new().unwrap();
    let save_path = temp_dir.path().join("download");

    let handle = open_handle(&layout, &save_path);
    assert_ok!(handle.check_fastresume(None).await);
    download_all(&handle, &layout, &content).await;
    let resume = assert_ok!(handle.save_resume_data().await);
    assert_ok!(handle.release_files().await);
    drop(handle);

    // Truncate the last file behind the client's back
    std::fs::write(save_path.join("c.bin"), b"xy").unwrap();

    let reopened = open_handle(&layout, &save_path);
    let outcome = assert_ok!(reopened.check_fastresume(Some(resume)).await);

    assert!(outcome.full_check);
    assert!(outcome.resume_rejection.is_some());
    assert_eq!(outcome.have, vec![true, true, false]);
}

#[tokio::test]
async fn test_rename_and_move_are_restored_from_resume_data() {
    let (layout, content) = multi_file_layout();
    let temp_dir = TempDir::new().unwrap();
    let save_path = temp_dir.path().join("download");
    let moved_path = temp_dir.path().join("library");

    let handle = open_handle(&layout, &save_path);
    assert_ok!(handle.check_fastresume(None).await);
    download_all(&handle, &layout, &content).await;

    assert_ok!(handle.rename_file(0, PathBuf::from("renamed/first.bin")).await);
    assert_ok!(handle.move_storage(moved_path.clone()).await);
    assert!(moved_path.join("renamed/first.bin").exists());
    assert!(!save_path.join("a.bin").exists());

    // Data is still readable at its new location
    let data = assert_ok!(handle.read(PieceRequest::new(PieceIndex::new(0), 0, 16)).await);
    assert_eq!(&data[..], &content[..16]);

    let resume = assert_ok!(handle.save_resume_data().await);
    assert!(resume.mapped_files.is_some());
    assert_ok!(handle.release_files().await);
    drop(handle);

    let reopened = open_handle(&layout, &moved_path);
    let outcome = assert_ok!(reopened.check_fastresume(Some(resume)).await);
    assert!(!outcome.full_check);
    let data = assert_ok!(reopened.read(PieceRequest::new(PieceIndex::new(0), 4, 8)).await);
    assert_eq!(&data[..], &content[4..12]);
}

#[tokio::test]
async fn test_delete_files_leaves_nothing_to_resume() {
    let (layout, content) = multi_file_layout();
    let temp_dir = TempDir::new().unwrap();
    let save_path = temp_dir.path().join("download");

    let handle = open_handle(&layout, &save_path);
    assert_ok!(handle.check_fastresume(None).await);
    download_all(&handle, &layout, &content).await;

    assert_ok!(handle.delete_files().await);
    assert!(!save_path.join("dir/b.bin").exists());
    assert_eq!(handle.check_state(), CheckState::None);

    let outcome = assert_ok!(handle.check_fastresume(None).await);
    assert!(!outcome.full_check);
    assert_eq!(outcome.num_have(), 0);

    let error = assert_err!(handle.finalize_file(7).await);
    assert!(matches!(error, DiskError::FatalDisk { .. }));
}
