//! Bounded write-back page cache layered over the [`Pager`].
//!
//! Entries are evicted least-recently-used first. Dirty entries are written
//! through the pager before they leave the cache, and an entry is only dropped
//! once that write succeeded.

use crate::file::Pager;
use crate::page::{Page, PageNum};
use crate::{Result, StorageError};
use log::{debug, trace, warn};
use std::collections::{BTreeMap, HashMap};

struct Frame {
    page: Page,
    dirty: bool,
    /// Tick of the last access; key into `PageCache::recency`.
    last_used: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

pub struct PageCache {
    pager: Pager,
    capacity: usize,
    frames: HashMap<PageNum, Frame>,
    /// Access tick -> page number, oldest first.
    recency: BTreeMap<u64, PageNum>,
    tick: u64,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(pager: Pager, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(StorageError::InvalidConfig(
                "cache capacity must be at least one page".to_string(),
            ));
        }

        Ok(Self {
            pager,
            capacity,
            frames: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            tick: 0,
            stats: CacheStats::default(),
        })
    }

    /// Return page `page_num` and whether it was already resident. Misses read
    /// through the pager and are admitted clean.
    pub fn get(&mut self, page_num: PageNum) -> Result<(&Page, bool)> {
        if self.frames.contains_key(&page_num) {
            self.stats.hits += 1;
            self.touch(page_num);
            return Ok((&self.frames[&page_num].page, true));
        }

        self.stats.misses += 1;
        let page = self.pager.get_page(page_num)?;
        self.admit(page_num, page, false)?;
        Ok((&self.frames[&page_num].page, false))
    }

    /// Store `data` as the new contents of `page_num` and mark it dirty.
    pub fn put(&mut self, page_num: PageNum, data: &[u8]) -> Result<()> {
        self.pager.check_page(page_num)?;
        let page = Page::from_bytes(data, self.pager.page_size())?;
        self.admit(page_num, page, true)
    }

    /// Drop `page_num` from the cache, writing it back first if dirty.
    pub fn evict(&mut self, page_num: PageNum) -> Result<()> {
        let Some(frame) = self.frames.get(&page_num) else {
            return Ok(());
        };

        if frame.dirty {
            self.pager.write_page(page_num, frame.page.as_bytes())?;
            self.stats.write_backs += 1;
        }

        if let Some(frame) = self.frames.remove(&page_num) {
            self.recency.remove(&frame.last_used);
        }
        self.stats.evictions += 1;
        trace!("evicted page {page_num}");
        Ok(())
    }

    /// Drop `page_num` without writing it back. For pages that are no longer
    /// reachable, whose contents must not reach the disk again.
    pub fn discard(&mut self, page_num: PageNum) {
        if let Some(frame) = self.frames.remove(&page_num) {
            self.recency.remove(&frame.last_used);
            trace!("discarded page {page_num}");
        }
    }

    /// Write every dirty entry back, keeping them resident.
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<PageNum> = self
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(&page_num, _)| page_num)
            .collect();
        dirty.sort_unstable();

        for page_num in &dirty {
            if let Some(frame) = self.frames.get_mut(page_num) {
                self.pager.write_page(*page_num, frame.page.as_bytes())?;
                frame.dirty = false;
                self.stats.write_backs += 1;
            }
        }

        self.pager.flush()?;
        if !dirty.is_empty() {
            debug!("flushed {} dirty pages", dirty.len());
        }
        Ok(())
    }

    /// Flush, then drop everything.
    pub fn clear(&mut self) -> Result<()> {
        self.flush()?;
        self.frames.clear();
        self.recency.clear();
        Ok(())
    }

    pub fn allocate(&mut self) -> Result<PageNum> {
        self.pager.allocate_page()
    }

    /// Clear the cache and close the pager. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.pager.is_closed() {
            return Ok(());
        }
        self.clear()?;
        self.pager.close()
    }

    pub fn contains(&self, page_num: PageNum) -> bool {
        self.frames.contains_key(&page_num)
    }

    pub fn is_dirty(&self, page_num: PageNum) -> bool {
        self.frames.get(&page_num).is_some_and(|frame| frame.dirty)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    pub fn page_count(&self) -> u32 {
        self.pager.page_count()
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    fn admit(&mut self, page_num: PageNum, page: Page, dirty: bool) -> Result<()> {
        if let Some(frame) = self.frames.get_mut(&page_num) {
            frame.page = page;
            frame.dirty |= dirty;
            self.touch(page_num);
            return Ok(());
        }

        while self.frames.len() >= self.capacity {
            self.evict_lru()?;
        }

        self.tick += 1;
        self.recency.insert(self.tick, page_num);
        self.frames.insert(
            page_num,
            Frame {
                page,
                dirty,
                last_used: self.tick,
            },
        );
        Ok(())
    }

    fn touch(&mut self, page_num: PageNum) {
        if let Some(frame) = self.frames.get_mut(&page_num) {
            self.tick += 1;
            self.recency.remove(&frame.last_used);
            frame.last_used = self.tick;
            self.recency.insert(self.tick, page_num);
        }
    }

    fn evict_lru(&mut self) -> Result<()> {
        match self.recency.first_key_value() {
            Some((_, &victim)) => self.evict(victim),
            None => Err(StorageError::InvalidConfig(
                "cache is full but tracks no pages".to_string(),
            )),
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(
                "failed to flush page cache for {}: {}",
                self.pager.path().display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAGE: usize = 64;

    fn cache_with_pages(capacity: usize, pages: u32) -> (TempDir, PageCache) {
        let dir = TempDir::new().unwrap();
        let mut pager = Pager::open(dir.path().join("cache.db"), PAGE).unwrap();
        for _ in 0..pages {
            pager.allocate_page().unwrap();
        }
        (dir, PageCache::new(pager, capacity).unwrap())
    }

    fn filled(byte: u8) -> Vec<u8> {
        vec![byte; PAGE]
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let dir = TempDir::new().unwrap();
        let pager = Pager::open(dir.path().join("cache.db"), PAGE).unwrap();

        assert!(matches!(
            PageCache::new(pager, 0).err().unwrap(),
            StorageError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_get_reports_hit_flag() {
        let (_dir, mut cache) = cache_with_pages(4, 2);

        let (page, hit) = cache.get(1).unwrap();
        assert!(!hit);
        assert!(page.is_zeroed());

        let (_, hit) = cache.get(1).unwrap();
        assert!(hit);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_put_marks_dirty_without_writing() {
        let (dir, mut cache) = cache_with_pages(4, 1);

        cache.put(1, &filled(7)).unwrap();

        assert!(cache.is_dirty(1));
        let len = std::fs::metadata(dir.path().join("cache.db")).unwrap().len();
        assert_eq!(len, PAGE as u64);
    }

    #[test]
    fn test_put_rejects_wrong_size_and_range() {
        let (_dir, mut cache) = cache_with_pages(4, 1);

        assert!(matches!(
            cache.put(1, &[1, 2, 3]).unwrap_err(),
            StorageError::SizeMismatch { .. }
        ));
        assert!(matches!(
            cache.put(9, &filled(1)).unwrap_err(),
            StorageError::OutOfRange { .. }
        ));
        assert!(matches!(
            cache.put(0, &filled(1)).unwrap_err(),
            StorageError::ReservedPage(0)
        ));
    }

    #[test]
    fn test_lru_victim_is_least_recently_used() {
        let (_dir, mut cache) = cache_with_pages(2, 3);

        cache.put(1, &filled(1)).unwrap();
        cache.put(2, &filled(2)).unwrap();
        // Refresh page 1 so page 2 becomes the oldest.
        cache.get(1).unwrap();
        cache.put(3, &filled(3)).unwrap();

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() {
        let (_dir, mut cache) = cache_with_pages(1, 2);

        cache.put(1, &filled(0xAA)).unwrap();
        cache.put(2, &filled(0xBB)).unwrap();

        assert!(!cache.contains(1));
        assert_eq!(cache.stats().write_backs, 1);
        assert_eq!(
            cache.pager_mut().get_page(1).unwrap().as_bytes(),
            filled(0xAA).as_slice()
        );
    }

    #[test]
    fn test_get_after_put_survives_eviction() {
        let (_dir, mut cache) = cache_with_pages(2, 4);

        cache.put(1, &filled(1)).unwrap();
        cache.put(1, &filled(9)).unwrap();
        for page_num in 2..=4 {
            cache.put(page_num, &filled(page_num as u8)).unwrap();
        }

        let (page, hit) = cache.get(1).unwrap();
        assert!(!hit);
        assert_eq!(page.as_bytes(), filled(9).as_slice());
    }

    #[test]
    fn test_explicit_evict_flushes() {
        let (_dir, mut cache) = cache_with_pages(4, 1);

        cache.put(1, &filled(5)).unwrap();
        cache.evict(1).unwrap();
        cache.evict(1).unwrap();

        assert!(cache.is_empty());
        assert_eq!(
            cache.pager_mut().get_page(1).unwrap().as_bytes(),
            filled(5).as_slice()
        );
    }

    #[test]
    fn test_discard_drops_dirty_page_unwritten() {
        let (_dir, mut cache) = cache_with_pages(4, 2);

        cache.put(1, &filled(3)).unwrap();
        cache.put(2, &filled(4)).unwrap();
        cache.discard(1);
        cache.discard(1);
        cache.flush().unwrap();

        assert!(!cache.contains(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().write_backs, 1);
        assert!(cache.pager_mut().get_page(1).unwrap().is_zeroed());

        // The freed recency slot no longer names page 1.
        cache.put(1, &filled(5)).unwrap();
        assert!(cache.is_dirty(1));
    }

    #[test]
    fn test_clear_flushes_and_empties() {
        let (_dir, mut cache) = cache_with_pages(4, 2);

        cache.put(1, &filled(1)).unwrap();
        cache.put(2, &filled(2)).unwrap();
        cache.clear().unwrap();

        assert!(cache.is_empty());
        assert_eq!(cache.stats().write_backs, 2);
        let (page, hit) = cache.get(2).unwrap();
        assert!(!hit);
        assert_eq!(page.as_bytes(), filled(2).as_slice());
    }

    #[test]
    fn test_close_persists_dirty_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        {
            let mut pager = Pager::open(&path, PAGE).unwrap();
            pager.allocate_page().unwrap();
            let mut cache = PageCache::new(pager, 4).unwrap();
            cache.put(1, &filled(0x42)).unwrap();
            cache.close().unwrap();
            cache.close().unwrap();
        }

        let mut pager = Pager::open(&path, PAGE).unwrap();
        assert_eq!(pager.get_page(1).unwrap().as_bytes(), filled(0x42).as_slice());
    }
}
