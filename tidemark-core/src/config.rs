//! Centralized configuration for Tidemark.
//!
//! All tunable parameters of the storage layer are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::storage::StorageMode;

/// Central configuration for all Tidemark components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TidemarkConfig {
    pub disk: DiskConfig,
}

/// Piece manager and storage backend configuration.
///
/// Controls the allocation strategy, what happens automatically after a
/// resume check, and the sizes of the caches kept per torrent.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Allocation strategy for new torrents
    pub storage_mode: StorageMode,
    /// Size every file up front when storage is initialized
    pub allocate_files: bool,
    /// Run a full check when resume data is rejected
    pub auto_full_check: bool,
    /// Move out-of-place pieces home after a check in compact mode
    pub auto_migrate: bool,
    /// Maximum number of slots in compact mode (None = one per piece)
    pub compact_slot_limit: Option<u32>,
    /// Bytes read per step while hashing a slot
    pub hash_block_size: usize,
    /// Whole pieces kept in the read cache
    pub read_cache_pieces: usize,
    /// Open file handles kept per torrent
    pub file_handle_limit: usize,
    /// Allowed drift between recorded and current file modification times
    pub mtime_tolerance: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::Full,
            allocate_files: false,
            auto_full_check: true,
            auto_migrate: true,
            compact_slot_limit: None,
            hash_block_size: 16384, // 16 KiB
            read_cache_pieces: 32,
            file_handle_limit: 16,
            mtime_tolerance: Duration::from_secs(2),
        }
    }
}

impl DiskConfig {
    /// Small buffers and caches so tests exercise chunking and eviction.
    pub fn for_testing() -> Self {
        Self {
            hash_block_size: 7, // Deliberately not a divisor of test piece sizes
            read_cache_pieces: 2,
            file_handle_limit: 2,
            ..Default::default()
        }
    }

    /// Testing configuration in compact mode.
    pub fn compact_for_testing() -> Self {
        Self {
            storage_mode: StorageMode::Compact,
            ..Self::for_testing()
        }
    }
}

impl TidemarkConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("TIDEMARK_STORAGE_MODE") {
            if let Ok(mode) = mode.parse::<StorageMode>() {
                config.disk.storage_mode = mode;
            }
        }

        if let Ok(allocate) = std::env::var("TIDEMARK_ALLOCATE_FILES") {
            config.disk.allocate_files = allocate.parse().unwrap_or(false);
        }

        if let Ok(pieces) = std::env::var("TIDEMARK_READ_CACHE_PIECES") {
            if let Ok(count) = pieces.parse::<usize>() {
                config.disk.read_cache_pieces = count;
            }
        }

        if let Ok(handles) = std::env::var("TIDEMARK_FILE_HANDLES") {
            if let Ok(count) = handles.parse::<usize>() {
                config.disk.file_handle_limit = count;
            }
        }

        if let Ok(limit) = std::env::var("TIDEMARK_COMPACT_SLOT_LIMIT") {
            if let Ok(slots) = limit.parse::<u32>() {
                config.disk.compact_slot_limit = Some(slots);
            }
        }

        if let Ok(auto_check) = std::env::var("TIDEMARK_AUTO_FULL_CHECK") {
            config.disk.auto_full_check = auto_check.parse().unwrap_or(true);
        }

        if let Ok(auto_migrate) = std::env::var("TIDEMARK_AUTO_MIGRATE") {
            config.disk.auto_migrate = auto_migrate.parse().unwrap_or(true);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            disk: DiskConfig::for_testing(),
        }
    }
}
