use super::{BTree, Cursor};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// A [`BTree`] behind one mutex, cloneable across threads.
///
/// Every call takes the lock for its whole duration. Cursors only exist inside
/// [`SharedBTree::with_cursor`], so a traversal never interleaves with a write.
#[derive(Clone)]
pub struct SharedBTree {
    inner: Arc<Mutex<BTree>>,
}

impl SharedBTree {
    pub fn new(tree: BTree) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tree)),
        }
    }

    pub fn insert(&self, key: u64, value: &[u8]) -> Result<()> {
        self.inner.lock().insert(key, value)
    }

    pub fn find(&self, key: u64) -> Result<Vec<u8>> {
        self.inner.lock().find(key)
    }

    pub fn delete(&self, key: u64) -> Result<()> {
        self.inner.lock().delete(key)
    }

    pub fn with_cursor<T>(&self, f: impl FnOnce(&mut Cursor<'_>) -> Result<T>) -> Result<T> {
        let mut tree = self.inner.lock();
        let mut cursor = tree.cursor()?;
        f(&mut cursor)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock().close()
    }
}

impl From<BTree> for SharedBTree {
    fn from(tree: BTree) -> Self {
        Self::new(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StorageConfig, StorageError};
    use std::thread;
    use tempfile::TempDir;

    fn shared_tree(dir: &TempDir) -> SharedBTree {
        let config = StorageConfig::builder()
            .page_size(256)
            .value_size(8)
            .cache_capacity(16)
            .build()
            .unwrap();
        BTree::open(dir.path().join("shared.db"), &config)
            .unwrap()
            .into()
    }

    #[test]
    fn test_concurrent_inserts_from_threads() {
        let dir = TempDir::new().unwrap();
        let tree = shared_tree(&dir);

        let handles: Vec<_> = (0..4u64)
            .map(|worker| {
                let tree = tree.clone();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let key = i * 4 + worker;
                        tree.insert(key, &key.to_le_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let keys = tree
            .with_cursor(|cursor| {
                let mut keys = Vec::new();
                while let Some(key) = cursor.key() {
                    keys.push(key);
                    cursor.next()?;
                }
                Ok(keys)
            })
            .unwrap();

        assert_eq!(keys, (0..400).collect::<Vec<u64>>());
    }

    #[test]
    fn test_close_is_visible_to_clones() {
        let dir = TempDir::new().unwrap();
        let tree = shared_tree(&dir);
        let other = tree.clone();

        tree.insert(1, b"a").unwrap();
        other.close().unwrap();

        assert!(matches!(tree.find(1).unwrap_err(), StorageError::Closed));
    }
}
