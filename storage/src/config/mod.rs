//! Engine configuration.

use crate::btree::NodeLayout;
use crate::page::{PageNum, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::row::ROW_SIZE;
use crate::{Result, StorageError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Settings shared by the pager, the page cache and the B-tree.
///
/// `page_size` and `value_size` are baked into the file on creation; reopening
/// a file with different values fails.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StorageConfig {
    /// Bytes per page, header page included.
    pub page_size: usize,

    /// Number of pages the cache keeps resident.
    pub cache_capacity: usize,

    /// Width of the value slot in every leaf cell.
    pub value_size: usize,

    /// Upper bound on the page count (header page included). `None` = 2^32 - 1.
    pub max_pages: Option<PageNum>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            value_size: ROW_SIZE,
            max_pages: None,
        }
    }
}

impl StorageConfig {
    pub fn builder() -> StorageConfigBuilder {
        StorageConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }

        if self.cache_capacity == 0 {
            return Err(StorageError::InvalidConfig(
                "cache capacity must be at least one page".to_string(),
            ));
        }

        // Zero marks "no tree yet" in the file header.
        if self.value_size == 0 {
            return Err(StorageError::InvalidConfig(
                "value size must be at least one byte".to_string(),
            ));
        }

        if let Some(max_pages) = self.max_pages {
            // Header page plus the root leaf.
            if max_pages < 2 {
                return Err(StorageError::InvalidConfig(format!(
                    "page limit {max_pages} leaves no room for a root page"
                )));
            }
        }

        NodeLayout::new(self.page_size, self.value_size).map(|_| ())
    }
}

#[derive(Default)]
pub struct StorageConfigBuilder {
    config: StorageConfig,
}

impl StorageConfigBuilder {
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn cache_capacity(mut self, pages: usize) -> Self {
        self.config.cache_capacity = pages;
        self
    }

    pub fn value_size(mut self, bytes: usize) -> Self {
        self.config.value_size = bytes;
        self
    }

    pub fn max_pages(mut self, pages: PageNum) -> Self {
        self.config.max_pages = Some(pages);
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<StorageConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
