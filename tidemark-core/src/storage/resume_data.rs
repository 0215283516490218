//! Persisted fast-resume record

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::StorageMode;

/// Current resume record layout.
pub const RESUME_FORMAT_VERSION: u32 = 1;

/// Size and modification time of one file when the record was written.
///
/// Missing files are recorded as size 0, mtime 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub size: u64,
    /// Seconds since the Unix epoch
    pub mtime: i64,
}

/// Snapshot of a piece manager written after a clean shutdown.
///
/// Lets startup skip re-hashing every slot when the files are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    pub format_version: u32,
    pub storage_mode: StorageMode,
    pub num_pieces: u32,
    pub piece_length: u32,
    /// Verified pieces, indexed by piece
    pub pieces: Vec<bool>,
    /// Compact mode only: owner of each slot up to the last allocated one
    #[serde(default)]
    pub slots: Vec<Option<u32>>,
    /// One entry per file, in layout order
    #[serde(default)]
    pub file_sizes: Vec<FileFingerprint>,
    /// File names that differ from the torrent's own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_files: Option<Vec<PathBuf>>,
}

impl ResumeData {
    /// Empty record for a torrent; backends fill in their entries.
    pub fn new(storage_mode: StorageMode, num_pieces: u32, piece_length: u32) -> Self {
        Self {
            format_version: RESUME_FORMAT_VERSION,
            storage_mode,
            num_pieces,
            piece_length,
            pieces: vec![false; num_pieces as usize],
            slots: Vec::new(),
            file_sizes: Vec::new(),
            mapped_files: None,
        }
    }

    /// Serializes the record to JSON.
    ///
    /// # Errors
    ///
    /// - `serde_json::Error` - If serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a record previously produced by `to_json`.
    ///
    /// # Errors
    ///
    /// - `serde_json::Error` - If the input is not a valid record
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let mut resume = ResumeData::new(StorageMode::Compact, 4, 16384);
        resume.pieces = vec![true, false, true, false];
        resume.slots = vec![Some(2), None, Some(0)];
        resume.file_sizes = vec![FileFingerprint {
            size: 49152,
            mtime: 1_700_000_000,
        }];

        let json = resume.to_json().unwrap();
        assert_eq!(ResumeData::from_json(&json).unwrap(), resume);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{"format_version":1,"storage_mode":"full","num_pieces":2,"piece_length":16,"pieces":[true,true]}"#;
        let resume = ResumeData::from_json(json).unwrap();

        assert_eq!(resume.storage_mode, StorageMode::Full);
        assert!(resume.slots.is_empty());
        assert!(resume.file_sizes.is_empty());
        assert!(resume.mapped_files.is_none());
    }
}
