//! Storage engine for EmberDB
//!
//! This crate provides the low-level storage primitives: fixed-size pages in a
//! single database file, a write-back page cache, a B-tree index over those
//! pages with an ordered cursor, and the fixed-width row codec used by the
//! executor to turn records into leaf values.
//!
//! ```text
//!   Row codec ──► BTree / Cursor ──► Node layout
//!                      │
//!                      ▼
//!                  PageCache (LRU, write-back)
//!                      │
//!                      ▼
//!                    Pager ──► database file (page 0 = header)
//! ```

pub mod btree;
pub mod cache;
pub mod config;
pub mod file;
pub mod page;
pub mod row;

pub use btree::{BTree, Cursor, Node, NodeKind, NodeLayout, SharedBTree, TreeStats};
pub use cache::{CacheStats, PageCache};
pub use config::StorageConfig;
pub use file::{FileHeader, Pager};
pub use page::{Page, PageNum};
pub use row::{Row, ROW_SIZE};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt database file: {0}")]
    CorruptFile(String),

    #[error("Corrupt page: {0}")]
    CorruptPage(String),

    #[error("Page {page} out of range (page count {page_count})")]
    OutOfRange { page: PageNum, page_count: u32 },

    #[error("Page {0} is reserved for the file header")]
    ReservedPage(PageNum),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("Duplicate key {0}")]
    DuplicateKey(u64),

    #[error("Key {0} not found")]
    NotFound(u64),

    #[error("Database full: page limit {max_pages} reached")]
    Full { max_pages: u32 },

    #[error("Value of {len} bytes exceeds the {max} byte limit")]
    ValueTooLarge { len: usize, max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database is closed")]
    Closed,
}

impl StorageError {
    /// Attach a page number to a `CorruptPage` reason.
    pub(crate) fn in_page(self, page: PageNum) -> Self {
        match self {
            StorageError::CorruptPage(reason) => {
                StorageError::CorruptPage(format!("page {page}: {reason}"))
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
