use crate::{Result, StorageError};
use std::fmt;

/// Page number within the database file. Page 0 holds the file header.
pub type PageNum = u32;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page that still holds the file header and three cells per node.
pub const MIN_PAGE_SIZE: usize = 64;

/// Cell counts and value lengths are stored as u16.
pub const MAX_PAGE_SIZE: usize = 65536;

/// One fixed-size block of the database file.
///
/// Pages are plain byte buffers; their interpretation belongs to whoever reads
/// them (the pager for page 0, the B-tree node codec for everything else).
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    pub fn zeroed(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Copy `bytes` into a new page, which must be exactly `page_size` long.
    pub fn from_bytes(bytes: &[u8], page_size: usize) -> Result<Self> {
        if bytes.len() != page_size {
            return Err(StorageError::SizeMismatch {
                expected: page_size,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            data: bytes.to_vec().into_boxed_slice(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True for pages that were allocated but never written.
    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = &self.data[..self.data.len().min(16)];
        f.debug_struct("Page")
            .field("len", &self.data.len())
            .field("head", &preview)
            .finish()
    }
}
