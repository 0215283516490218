//! Compact mode: recovering a scrambled slot layout and migrating it home
//! while reads keep flowing.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use proptest::prelude::*;
use tidemark_core::storage::test_fixtures::{piece_bytes, single_file_layout, temp_file_storage};
use tidemark_core::storage::FileStorage;
use tidemark_core::{
    CheckState, DiskConfig, PieceIndex, PieceManager, PieceRequest, SlotIndex, StorageBackend,
    StorageHandle, TokioDiskExecutor, TorrentLayout,
};
use tokio_test::assert_ok;

fn compact_handle(
    layout: &Arc<TorrentLayout>,
    storage: &Arc<FileStorage>,
    config: DiskConfig,
) -> StorageHandle {
    let backend: Arc<dyn StorageBackend> = storage.clone();
    StorageHandle::new(PieceManager::new(
        Arc::clone(layout),
        backend,
        Arc::new(TokioDiskExecutor::current()),
        config,
    ))
}

/// Writes piece `piece` directly into `slot`, bypassing the table.
fn place(storage: &FileStorage, layout: &TorrentLayout, content: &[u8], piece: u32, slot: u32) {
    storage
        .write(
            SlotIndex::new(slot),
            0,
            piece_bytes(layout, content, PieceIndex::new(piece)),
        )
        .unwrap();
}

#[tokio::test]
async fn test_crossed_pieces_end_up_home() {
    let (layout, content) = single_file_layout(4, 32);
    let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
    // [D2, free, D0, free]
    place(&storage, &layout, &content, 2, 0);
    place(&storage, &layout, &content, 0, 2);

    let handle = compact_handle(&layout, &storage, DiskConfig::compact_for_testing());
    let outcome = assert_ok!(handle.check_fastresume(None).await);
    assert!(outcome.full_check);
    assert_eq!(
        outcome.out_of_place,
        vec![
            (PieceIndex::new(2), SlotIndex::new(0)),
            (PieceIndex::new(0), SlotIndex::new(2)),
        ]
    );

    // Queued behind the automatic migration, so nothing is left to do
    assert_eq!(assert_ok!(handle.migrate().await), 0);
    assert_eq!(handle.slot_for(PieceIndex::new(0)), Some(SlotIndex::new(0)));
    assert_eq!(handle.slot_for(PieceIndex::new(2)), Some(SlotIndex::new(2)));
    assert_eq!(handle.check_state(), CheckState::Finished);

    for index in [0, 2] {
        let piece = PieceIndex::new(index);
        let (data, hash) = assert_ok!(handle.read_and_hash(PieceRequest::whole_piece(piece, 32)).await);
        assert!(hash.valid);
        assert_eq!(&data[..], piece_bytes(&layout, &content, piece));
    }
}

#[tokio::test]
async fn test_reads_during_migration_see_correct_data() {
    let (layout, content) = single_file_layout(6, 32);
    let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
    // Every piece one slot to the right of home, piece 5 wrapped to slot 0
    for piece in 0..6 {
        place(&storage, &layout, &content, piece, (piece + 1) % 6);
    }

    let config = DiskConfig {
        auto_migrate: false,
        ..DiskConfig::compact_for_testing()
    };
    let handle = compact_handle(&layout, &storage, config);
    let outcome = assert_ok!(handle.check_files().await);
    assert_eq!(outcome.out_of_place.len(), 6);
    assert_eq!(handle.check_state(), CheckState::ExpandPieces);

    let reads = (0..6).map(|index| {
        handle.read(PieceRequest::whole_piece(PieceIndex::new(index), 32))
    });
    let (steps, results) = futures::join!(handle.migrate(), join_all(reads));

    assert!(assert_ok!(steps) > 0);
    for (index, result) in results.into_iter().enumerate() {
        let data = assert_ok!(result);
        assert_eq!(&data[..], piece_bytes(&layout, &content, PieceIndex::new(index as u32)));
    }
    for index in 0..6 {
        assert_eq!(handle.slot_for(PieceIndex::new(index)), Some(SlotIndex::new(index)));
    }
    assert_eq!(handle.check_state(), CheckState::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_pieces_written_during_migration_stay_intact() {
    for _round in 0..8 {
        let (layout, content) = single_file_layout(6, 32);
        let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
        // Odd pieces one slot early; odd slots hold unrecognized data
        for piece in [1, 3, 5] {
            place(&storage, &layout, &content, piece, piece - 1);
            storage
                .write(SlotIndex::new(piece), 0, &[0xAB; 32])
                .unwrap();
        }

        let config = DiskConfig {
            auto_migrate: false,
            ..DiskConfig::compact_for_testing()
        };
        let handle = compact_handle(&layout, &storage, config);
        let outcome = assert_ok!(handle.check_files().await);
        assert_eq!(outcome.out_of_place.len(), 3);

        // Even pieces have no slot; their first free slot is a migration target
        let writes = [0, 2, 4].map(|index| {
            let piece = PieceIndex::new(index);
            let data = Bytes::copy_from_slice(piece_bytes(&layout, &content, piece));
            handle.write(piece, 0, data)
        });
        let (steps, written) = futures::join!(handle.migrate(), join_all(writes));
        assert_ok!(steps);
        for result in written {
            assert_ok!(result);
        }
        assert!(handle.manager().slot_table().verify_invariants().is_ok());

        // Writes that landed after the last step may still be away from home
        assert_ok!(handle.migrate().await);
        for index in 0..6 {
            let piece = PieceIndex::new(index);
            assert_eq!(handle.slot_for(piece), Some(SlotIndex::new(index)));
            let hash = assert_ok!(handle.hash_piece(piece).await);
            assert!(hash.valid, "piece {index} corrupted");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_any_arrival_order_migrates_home(
        order in Just((0u32..8).collect::<Vec<_>>()).prop_shuffle()
    ) {
        tokio_test::block_on(async {
            let (layout, content) = single_file_layout(8, 32);
            let (_temp_dir, storage) = temp_file_storage(Arc::clone(&layout));
            let handle = compact_handle(&layout, &storage, DiskConfig::compact_for_testing());
            assert_ok!(handle.check_fastresume(None).await);

            for &index in &order {
                let piece = PieceIndex::new(index);
                let data = Bytes::copy_from_slice(piece_bytes(&layout, &content, piece));
                assert_ok!(handle.write(piece, 0, data).await);
            }
            assert_ok!(handle.release_files().await);

            let outcome = assert_ok!(handle.check_files().await);
            assert_eq!(outcome.num_have(), 8);
            assert_ok!(handle.migrate().await);

            for index in 0..8 {
                let piece = PieceIndex::new(index);
                assert_eq!(handle.slot_for(piece), Some(SlotIndex::new(index)));
                let hash = assert_ok!(handle.hash_piece(piece).await);
                assert!(hash.valid);
            }
        });
    }
}
