#![allow(dead_code)]

use emberdb_storage::{BTree, StorageConfig};
use tempfile::TempDir;
use tracing_subscriber::{fmt, EnvFilter};

/// Route the crate's `log` output through a test-captured subscriber.
/// Set `RUST_LOG=emberdb_storage=debug` to see splits and merges.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn small_config(page_size: usize, value_size: usize) -> StorageConfig {
    StorageConfig::builder()
        .page_size(page_size)
        .value_size(value_size)
        .cache_capacity(8)
        .build()
        .unwrap()
}

pub fn open_tree(dir: &TempDir, config: &StorageConfig) -> BTree {
    init_logging();
    tracing::debug!(?config, "opening test tree");
    BTree::open(dir.path().join("test.db"), config).unwrap()
}

pub fn collect_keys(tree: &mut BTree) -> Vec<u64> {
    let mut cursor = tree.cursor().unwrap();
    let mut keys = Vec::new();
    while let Some(key) = cursor.key() {
        keys.push(key);
        cursor.next().unwrap();
    }
    keys
}
