//! Integration tests for Tidemark
//!
//! Drive the piece manager through its async handle on the tokio executor
//! with real files, covering whole lifecycles rather than single operations.

#[path = "integration/compact_recovery.rs"]
mod compact_recovery;
#[path = "integration/storage_lifecycle.rs"]
mod storage_lifecycle;
