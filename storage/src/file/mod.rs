// storage/src/file/mod.rs

use crate::config::StorageConfig;
use crate::page::{Page, PageNum, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::{Result, StorageError};
use bytes::{Buf, BufMut};
use log::{debug, info, trace, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number to identify our database files
const DB_MAGIC: [u8; 4] = *b"EMDB";

const FILE_VERSION: u32 = 1;

pub const FILE_HEADER_SIZE: usize = 32;

/// Bytes covered by the header checksum (everything before it).
const CHECKSUMMED_BYTES: usize = 28;

/// Bookkeeping stored at the start of page 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    magic: [u8; 4],
    version: u32,
    page_size: u32,
    page_count: u32, // Header page included
    root_page: u32,  // 0 = no tree yet
    value_size: u32, // Leaf value width, 0 = no tree yet
}

impl FileHeader {
    fn new(page_size: u32) -> Self {
        Self {
            magic: DB_MAGIC,
            version: FILE_VERSION,
            page_size,
            page_count: 1,
            root_page: 0,
            value_size: 0,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn root_page(&self) -> u32 {
        self.root_page
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    fn to_bytes(self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        {
            let mut out = &mut bytes[..];
            out.put_slice(&self.magic);
            out.put_u32_le(self.version);
            out.put_u32_le(self.page_size);
            out.put_u32_le(self.page_count);
            out.put_u32_le(self.root_page);
            out.put_u32_le(self.value_size);
            out.put_u32_le(0); // reserved
        }

        let checksum = crc32fast::hash(&bytes[..CHECKSUMMED_BYTES]);
        bytes[CHECKSUMMED_BYTES..].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(StorageError::CorruptFile(format!(
                "header needs {FILE_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let mut input = &bytes[..FILE_HEADER_SIZE];
        let mut magic = [0u8; 4];
        input.copy_to_slice(&mut magic);
        let version = input.get_u32_le();
        let page_size = input.get_u32_le();
        let page_count = input.get_u32_le();
        let root_page = input.get_u32_le();
        let value_size = input.get_u32_le();
        let _reserved = input.get_u32_le();
        let checksum = input.get_u32_le();

        if magic != DB_MAGIC {
            return Err(StorageError::CorruptFile(
                "wrong magic number, not an EmberDB file".to_string(),
            ));
        }

        if version > FILE_VERSION {
            return Err(StorageError::CorruptFile(format!(
                "unsupported file version {version}"
            )));
        }

        let expected = crc32fast::hash(&bytes[..CHECKSUMMED_BYTES]);
        if checksum != expected {
            return Err(StorageError::CorruptFile(format!(
                "header checksum mismatch (stored {checksum:#010x}, computed {expected:#010x})"
            )));
        }

        Ok(Self {
            magic,
            version,
            page_size,
            page_count,
            root_page,
            value_size,
        })
    }
}

/// Maps page numbers to file offsets and owns the file handle.
///
/// Allocation is lazy: `allocate_page` only bumps the page count, and reads of
/// an allocated page that was never written return zeros. The header (page
/// count, root page) is written back on `flush` and `close`.
pub struct Pager {
    file: Option<File>,
    path: PathBuf,
    page_size: usize,
    header: FileHeader,
    header_dirty: bool,
    /// Pages physically present in the file.
    file_pages: u32,
    max_pages: u32,
}

impl Pager {
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref();

        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(StorageError::InvalidConfig(format!(
                "page size {page_size} outside {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(StorageError::CorruptFile(format!(
                "file length {len} is not a multiple of the page size {page_size}"
            )));
        }

        let mut pager = if len == 0 {
            let pager = Self {
                file: Some(file),
                path: path.to_path_buf(),
                page_size,
                header: FileHeader::new(page_size as u32),
                header_dirty: true,
                file_pages: 0,
                max_pages: PageNum::MAX,
            };
            info!("creating database file {}", path.display());
            pager
        } else {
            let file_pages = PageNum::try_from(len / page_size as u64).map_err(|_| {
                StorageError::CorruptFile(format!("file length {len} exceeds the page space"))
            })?;
            let header = Self::read_header(&mut file, page_size)?;

            Self {
                file: Some(file),
                path: path.to_path_buf(),
                page_size,
                header,
                header_dirty: false,
                file_pages,
                max_pages: PageNum::MAX,
            }
        };

        if pager.file_pages == 0 {
            pager.write_header()?;
        }

        // Pages written back by the cache before a crash may extend past the
        // page count recorded at the last close.
        if pager.header.page_count < pager.file_pages {
            warn!(
                "{}: header records {} pages, file holds {}",
                path.display(),
                pager.header.page_count,
                pager.file_pages
            );
            pager.header.page_count = pager.file_pages;
            pager.header_dirty = true;
        }

        debug!(
            "opened {} (page size {}, {} pages, root {})",
            path.display(),
            page_size,
            pager.header.page_count,
            pager.header.root_page
        );

        Ok(pager)
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let mut pager = Self::open(path, config.page_size)?;
        if let Some(max_pages) = config.max_pages {
            pager.max_pages = max_pages;
        }
        Ok(pager)
    }

    /// Read page `page_num`. Allocated pages that were never written read as zeros.
    pub fn get_page(&mut self, page_num: PageNum) -> Result<Page> {
        self.check_page(page_num)?;

        let mut page = Page::zeroed(self.page_size);
        if page_num < self.file_pages {
            let offset = page_num as u64 * self.page_size as u64;
            let file = self.file_mut()?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(page.as_bytes_mut())?;
        }

        trace!("read page {page_num}");
        Ok(page)
    }

    pub fn write_page(&mut self, page_num: PageNum, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(StorageError::SizeMismatch {
                expected: self.page_size,
                actual: data.len(),
            });
        }
        self.check_page(page_num)?;

        let offset = page_num as u64 * self.page_size as u64;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        if page_num >= self.file_pages {
            self.file_pages = page_num + 1;
        }

        trace!("wrote page {page_num}");
        Ok(())
    }

    /// Hand out the next page number. Nothing touches the disk until the page
    /// is written.
    pub fn allocate_page(&mut self) -> Result<PageNum> {
        if self.file.is_none() {
            return Err(StorageError::Closed);
        }
        self.ensure_available(1)?;

        let page_num = self.header.page_count;
        self.header.page_count += 1;
        self.header_dirty = true;

        trace!("allocated page {page_num}");
        Ok(page_num)
    }

    /// Fail with `Full` unless `count` more pages can be allocated.
    pub fn ensure_available(&self, count: u32) -> Result<()> {
        let wanted = self.header.page_count as u64 + count as u64;
        if wanted > self.max_pages as u64 {
            return Err(StorageError::Full {
                max_pages: self.max_pages,
            });
        }
        Ok(())
    }

    /// Range check shared with the cache so bad page numbers fail on `put`
    /// rather than at eviction time.
    pub(crate) fn check_page(&self, page_num: PageNum) -> Result<()> {
        if self.file.is_none() {
            return Err(StorageError::Closed);
        }
        if page_num == 0 {
            return Err(StorageError::ReservedPage(page_num));
        }
        if page_num >= self.header.page_count {
            return Err(StorageError::OutOfRange {
                page: page_num,
                page_count: self.header.page_count,
            });
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.header.page_count
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root_page(&self) -> Option<PageNum> {
        match self.header.root_page {
            0 => None,
            root => Some(root),
        }
    }

    pub fn set_root_page(&mut self, root: PageNum) {
        if self.header.root_page != root {
            self.header.root_page = root;
            self.header_dirty = true;
        }
    }

    pub fn value_size(&self) -> Option<u32> {
        match self.header.value_size {
            0 => None,
            size => Some(size),
        }
    }

    pub fn set_value_size(&mut self, value_size: u32) {
        if self.header.value_size != value_size {
            self.header.value_size = value_size;
            self.header_dirty = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Write the header if it changed and push file data to disk.
    pub fn flush(&mut self) -> Result<()> {
        if self.header_dirty {
            self.write_header()?;
        }
        self.file_mut()?.sync_data()?;
        Ok(())
    }

    /// Write the header, sync and release the file. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }

        self.write_header()?;
        self.file_mut()?.sync_all()?;
        self.file = None;

        debug!(
            "closed {} ({} pages)",
            self.path.display(),
            self.header.page_count
        );
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(StorageError::Closed)
    }

    fn write_header(&mut self) -> Result<()> {
        // Create a full page for the header (for alignment)
        let mut header_page = vec![0u8; self.page_size];
        header_page[..FILE_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());

        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_page)?;

        if self.file_pages == 0 {
            self.file_pages = 1;
        }
        self.header_dirty = false;
        Ok(())
    }

    fn read_header(file: &mut File, page_size: usize) -> Result<FileHeader> {
        file.seek(SeekFrom::Start(0))?;

        let mut buffer = vec![0u8; page_size];
        file.read_exact(&mut buffer)?;

        let header = FileHeader::from_bytes(&buffer)?;

        if header.page_size as usize != page_size {
            return Err(StorageError::CorruptFile(format!(
                "file was created with page size {}, opened with {}",
                header.page_size, page_size
            )));
        }

        Ok(header)
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close {}: {}", self.path.display(), e);
        }
    }
}
