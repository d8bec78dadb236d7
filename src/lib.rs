//! Persistent multi-value B+-tree index over a paginated buffer cache.
//!
//! [`tree::MultiValueTree`] maps typed, optionally composite keys to
//! multisets of record ids and supports equality lookups, ordered range
//! scans in both directions and null-key storage in a one-page side file.
//! Writes run inside WAL-backed atomic operations provided by
//! [`recovery::AtomicOperationsManager`]; pages are served by the shared
//! [`buffer::BufferPool`] over a directory-rooted
//! [`storage::disk_manager::DiskManager`].

pub mod buffer;
pub mod config;
pub mod error;
pub mod recovery;
pub mod storage;
pub mod tree;

pub use config::{BufferPoolConfig, TreeConfig};
pub use error::{BrambleError, BrambleResult};
pub use tree::{
    Encryption, IndexKey, KeyCursor, KeyItem, KeyType, MultiValueTree, Rid, TreeCursor,
    TreeOptions,
};
