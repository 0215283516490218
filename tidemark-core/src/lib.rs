//! Tidemark Core - piece storage and integrity for BitTorrent clients
//!
//! Maps torrent pieces onto storage slots, verifies stored data against the
//! torrent's piece digests, and keeps the mapping consistent across restarts
//! through fast-resume records. Supports full allocation and compact
//! allocation with background migration of out-of-place pieces.

pub mod config;
pub mod disk;
pub mod executor;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{DiskConfig, TidemarkConfig};
pub use disk::{CheckOutcome, CheckState, DiskError, DiskResult, PieceManager, StatusCode, StorageHandle};
pub use executor::{DiskExecutor, InlineDiskExecutor, TokioDiskExecutor};
pub use storage::{BackendKind, ResumeData, StorageBackend, StorageError, StorageMode};
pub use torrent::{PieceIndex, PieceRequest, SlotIndex, TorrentLayout};
