//! B-tree index over cached pages.
//!
//! Keys are `u64`, values are byte strings no wider than the layout's value
//! slot. Leaves carry the data and a forward sibling link; internal nodes carry
//! separators and child page numbers. A key equal to a separator routes to the
//! child on its right.
//!
//! Mutations descend from the root recording an explicit path of
//! `(page, index)` frames. Splits and merges walk that path back up, so nodes
//! never store parent pointers.

mod cursor;
mod node;
mod shared;

pub use cursor::Cursor;
pub use node::{Node, NodeKind, NodeLayout, INTERNAL_CELL_SIZE, LEAF_CELL_OVERHEAD, NODE_HEADER_SIZE};
pub use shared::SharedBTree;

use crate::cache::{CacheStats, PageCache};
use crate::config::StorageConfig;
use crate::file::Pager;
use crate::page::PageNum;
use crate::{Result, StorageError};
use log::debug;
use std::path::Path;

/// Deeper than any tree the 32-bit page space can hold; guards against
/// cycles in corrupt files.
const MAX_DEPTH: usize = 64;

/// One step of a root-to-leaf descent. For internal nodes `index` is the child
/// taken; for the leaf it is a cell position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PathFrame {
    pub page: PageNum,
    pub index: usize,
}

/// Summary returned by [`BTree::check_integrity`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub height: usize,
    pub leaves: usize,
    pub internal_nodes: usize,
    pub keys: usize,
}

pub struct BTree {
    cache: PageCache,
    layout: NodeLayout,
    root: PageNum,
}

impl BTree {
    /// Open (or create) a database file and attach to the tree it holds.
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let pager = Pager::open_with_config(path, config)?;
        let root = pager.root_page().unwrap_or_else(|| pager.page_count());
        let cache = PageCache::new(pager, config.cache_capacity)?;
        Self::new(cache, root, config.value_size)
    }

    /// Attach to the tree rooted at `root`. When `root` is the next page to be
    /// allocated (a fresh file), an empty leaf root is created there.
    pub fn new(cache: PageCache, root: PageNum, value_size: usize) -> Result<Self> {
        let layout = NodeLayout::new(cache.page_size(), value_size)?;
        if value_size == 0 {
            return Err(StorageError::InvalidConfig(
                "value size must be at least one byte".to_string(),
            ));
        }

        if let Some(stored) = cache.pager().value_size() {
            if stored as usize != value_size {
                return Err(StorageError::InvalidConfig(format!(
                    "file was built with {stored}-byte values, opened with {value_size}"
                )));
            }
        }

        let page_count = cache.page_count();
        let mut tree = Self {
            cache,
            layout,
            root,
        };

        if root == page_count {
            let page = tree.cache.allocate()?;
            tree.store_node(page, &Node::new(NodeKind::Leaf))?;
            tree.set_root(page);
            debug!("created empty root leaf at page {page}");
        } else {
            // Surfaces OutOfRange / ReservedPage / CorruptPage for a bad root.
            tree.load_node(root)?;
            tree.cache.pager_mut().set_root_page(root);
        }
        tree.cache.pager_mut().set_value_size(value_size as u32);

        Ok(tree)
    }

    pub fn root_page(&self) -> PageNum {
        self.root
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn find(&mut self, key: u64) -> Result<Vec<u8>> {
        let mut path = self.descend(key)?;
        let (_, leaf) = Self::pop_leaf(&mut path)?;

        match leaf.search(key) {
            Ok(index) => Ok(leaf.values[index].clone()),
            Err(_) => Err(StorageError::NotFound(key)),
        }
    }

    pub fn insert(&mut self, key: u64, value: &[u8]) -> Result<()> {
        if value.len() > self.layout.value_size() {
            return Err(StorageError::ValueTooLarge {
                len: value.len(),
                max: self.layout.value_size(),
            });
        }

        let mut path = self.descend(key)?;
        let (leaf_frame, mut leaf) = Self::pop_leaf(&mut path)?;

        let position = match leaf.search(key) {
            Ok(_) => return Err(StorageError::DuplicateKey(key)),
            Err(position) => position,
        };

        // Reserve the whole split chain up front so a full file never leaves
        // a half-split tree behind.
        let needed = self.pages_needed_for_insert(&leaf, &path);
        if needed > 0 {
            self.cache.pager().ensure_available(needed)?;
        }

        leaf.insert_cell(position, key, value.to_vec());
        if leaf.num_keys() <= self.layout.leaf_max_cells() {
            return self.store_node(leaf_frame.page, &leaf);
        }

        let right_page = self.cache.allocate()?;
        let mut right = leaf.split_leaf();
        right.next_leaf = leaf.next_leaf;
        leaf.next_leaf = Some(right_page);
        let separator = right.keys[0];

        self.store_node(leaf_frame.page, &leaf)?;
        self.store_node(right_page, &right)?;
        debug!(
            "split leaf {} -> {} at key {}",
            leaf_frame.page, right_page, separator
        );

        self.insert_separator(path, leaf_frame.page, separator, right_page)
    }

    pub fn delete(&mut self, key: u64) -> Result<()> {
        let mut path = self.descend(key)?;
        let (leaf_frame, mut leaf) = Self::pop_leaf(&mut path)?;

        let position = leaf.search(key).map_err(|_| StorageError::NotFound(key))?;
        leaf.remove_cell(position);

        if path.is_empty() || leaf.num_keys() >= self.layout.leaf_min_cells() {
            return self.store_node(leaf_frame.page, &leaf);
        }

        self.rebalance(path, leaf_frame.page, leaf)
    }

    /// Cursor positioned at the smallest key.
    pub fn cursor(&mut self) -> Result<Cursor<'_>> {
        Cursor::new(self)
    }

    /// Number of levels, 1 for a lone leaf root.
    pub fn height(&mut self) -> Result<usize> {
        let mut height = 1;
        let mut page = self.root;
        loop {
            let node = self.load_node(page)?;
            if node.is_leaf() {
                return Ok(height);
            }
            page = node.child(0).ok_or_else(|| {
                StorageError::CorruptPage(format!("page {page}: internal node without children"))
            })?;
            height += 1;
            if height > MAX_DEPTH {
                return Err(StorageError::CorruptPage(format!(
                    "tree deeper than {MAX_DEPTH} levels"
                )));
            }
        }
    }

    /// Walk the whole tree checking key order, separator bounds, equal leaf
    /// depth, minimum occupancy and the leaf sibling chain.
    pub fn check_integrity(&mut self) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        let mut leaves: Vec<(PageNum, Option<PageNum>)> = Vec::new();
        let mut leaf_depth = None;

        self.check_subtree(
            self.root,
            1,
            (None, None),
            true,
            &mut stats,
            &mut leaves,
            &mut leaf_depth,
        )?;

        for pair in leaves.windows(2) {
            let ((page, next), (following, _)) = (pair[0], pair[1]);
            if next != Some(following) {
                return Err(StorageError::CorruptPage(format!(
                    "leaf {page} links to {next:?}, expected {following}"
                )));
            }
        }
        if let Some(&(page, Some(next))) = leaves.last() {
            return Err(StorageError::CorruptPage(format!(
                "last leaf {page} links to {next}"
            )));
        }

        stats.height = leaf_depth.unwrap_or(1);
        Ok(stats)
    }

    /// Write every dirty page and the file header to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush()
    }

    /// Flush and close the underlying file. Later operations fail with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        self.cache.close()
    }

    pub(crate) fn load_node(&mut self, page: PageNum) -> Result<Node> {
        let (bytes, _) = self.cache.get(page)?;
        Node::deserialize(&self.layout, bytes.as_bytes()).map_err(|e| e.in_page(page))
    }

    fn store_node(&mut self, page: PageNum, node: &Node) -> Result<()> {
        let bytes = node.serialize(&self.layout).map_err(|e| e.in_page(page))?;
        self.cache.put(page, &bytes)
    }

    fn set_root(&mut self, root: PageNum) {
        if self.root != root {
            debug!("root moved from page {} to {}", self.root, root);
        }
        self.root = root;
        self.cache.pager_mut().set_root_page(root);
    }

    /// Root-to-leaf descent for `key`. The leaf frame's index is the lower
    /// bound of `key` within the leaf.
    fn descend(&mut self, key: u64) -> Result<Vec<(PathFrame, Node)>> {
        let mut path = Vec::new();
        let mut page = self.root;

        loop {
            let node = self.load_node(page)?;
            if node.is_leaf() {
                let index = node.lower_bound(key);
                path.push((PathFrame { page, index }, node));
                return Ok(path);
            }

            let index = node.child_index(key);
            let child = node.child(index).ok_or_else(|| {
                StorageError::CorruptPage(format!("page {page}: no child at index {index}"))
            })?;
            path.push((PathFrame { page, index }, node));

            if path.len() >= MAX_DEPTH {
                return Err(StorageError::CorruptPage(format!(
                    "tree deeper than {MAX_DEPTH} levels"
                )));
            }
            page = child;
        }
    }

    fn pop_leaf(path: &mut Vec<(PathFrame, Node)>) -> Result<(PathFrame, Node)> {
        path.pop()
            .ok_or_else(|| StorageError::CorruptPage("descent produced no leaf".to_string()))
    }

    /// Pages an insert into `leaf` allocates if every full node on the way up
    /// splits, including a new root.
    fn pages_needed_for_insert(&self, leaf: &Node, ancestors: &[(PathFrame, Node)]) -> u32 {
        if leaf.num_keys() < self.layout.leaf_max_cells() {
            return 0;
        }

        let mut needed = 1;
        for (_, node) in ancestors.iter().rev() {
            if node.num_keys() < self.layout.internal_max_keys() {
                return needed;
            }
            needed += 1;
        }
        needed + 1
    }

    /// Insert `separator` between `left` and its new sibling `right` in the
    /// parent, splitting parents as long as they overflow.
    fn insert_separator(
        &mut self,
        mut path: Vec<(PathFrame, Node)>,
        mut left: PageNum,
        mut separator: u64,
        mut right: PageNum,
    ) -> Result<()> {
        loop {
            let Some((frame, mut parent)) = path.pop() else {
                let new_root = self.cache.allocate()?;
                self.store_node(new_root, &Node::new_root(left, separator, right))?;
                self.set_root(new_root);
                return Ok(());
            };

            if parent.child(frame.index) != Some(left) {
                return Err(StorageError::CorruptPage(format!(
                    "page {}: child {} expected at index {}",
                    frame.page, left, frame.index
                )));
            }

            parent.keys.insert(frame.index, separator);
            parent.children.insert(frame.index + 1, right);
            if parent.num_keys() <= self.layout.internal_max_keys() {
                return self.store_node(frame.page, &parent);
            }

            let (promoted, sibling) = parent.split_internal()?;
            let sibling_page = self.cache.allocate()?;
            self.store_node(frame.page, &parent)?;
            self.store_node(sibling_page, &sibling)?;
            debug!(
                "split internal {} -> {} promoting {}",
                frame.page, sibling_page, promoted
            );

            left = frame.page;
            separator = promoted;
            right = sibling_page;
        }
    }

    /// Repair an underfull `node` (at `page`) and any ancestors it drags under
    /// the minimum, collapsing the root when it runs out of separators.
    fn rebalance(
        &mut self,
        mut path: Vec<(PathFrame, Node)>,
        mut page: PageNum,
        mut node: Node,
    ) -> Result<()> {
        while let Some((frame, mut parent)) = path.pop() {
            self.fix_underflow(&mut parent, frame.index, page, node)?;

            if path.is_empty() {
                if parent.num_keys() == 0 {
                    let child = parent.child(0).ok_or_else(|| {
                        StorageError::CorruptPage(format!(
                            "page {}: root lost its last child",
                            frame.page
                        ))
                    })?;
                    self.cache.discard(frame.page);
                    self.set_root(child);
                    return Ok(());
                }
                return self.store_node(frame.page, &parent);
            }

            self.store_node(frame.page, &parent)?;
            if parent.num_keys() >= self.layout.internal_min_keys() {
                return Ok(());
            }

            page = frame.page;
            node = parent;
        }

        Ok(())
    }

    /// Give child `index` of `parent` (already loaded as `node`) back its
    /// minimum occupancy: borrow from a sibling with slack, else merge.
    fn fix_underflow(
        &mut self,
        parent: &mut Node,
        index: usize,
        page: PageNum,
        mut node: Node,
    ) -> Result<()> {
        let min = self.layout.min_keys(node.kind);

        let left = match index.checked_sub(1).and_then(|i| parent.child(i)) {
            Some(left_page) => Some((left_page, self.load_node(left_page)?)),
            None => None,
        };
        let right = match parent.child(index + 1) {
            Some(right_page) => Some((right_page, self.load_node(right_page)?)),
            None => None,
        };

        match (left, right) {
            (Some((left_page, mut left)), _) if left.num_keys() > min => {
                rotate_right(parent, index - 1, &mut left, &mut node)?;
                self.store_node(left_page, &left)?;
                self.store_node(page, &node)
            }
            (_, Some((right_page, mut right))) if right.num_keys() > min => {
                rotate_left(parent, index, &mut node, &mut right)?;
                self.store_node(page, &node)?;
                self.store_node(right_page, &right)
            }
            (Some((left_page, mut left)), _) => {
                merge(parent, index - 1, &mut left, node)?;
                self.store_node(left_page, &left)?;
                self.cache.discard(page);
                debug!("merged page {page} into {left_page}");
                Ok(())
            }
            (None, Some((right_page, right))) => {
                merge(parent, index, &mut node, right)?;
                self.store_node(page, &node)?;
                self.cache.discard(right_page);
                debug!("merged page {right_page} into {page}");
                Ok(())
            }
            (None, None) => Err(StorageError::CorruptPage(format!(
                "page {page} has no siblings to rebalance with"
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_subtree(
        &mut self,
        page: PageNum,
        depth: usize,
        bounds: (Option<u64>, Option<u64>),
        is_root: bool,
        stats: &mut TreeStats,
        leaves: &mut Vec<(PageNum, Option<PageNum>)>,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(StorageError::CorruptPage(format!(
                "tree deeper than {MAX_DEPTH} levels"
            )));
        }

        let node = self.load_node(page)?;
        let (lower, upper) = bounds;

        if let Some(&key) = node
            .keys()
            .iter()
            .find(|&&k| lower.is_some_and(|lo| k < lo) || upper.is_some_and(|hi| k >= hi))
        {
            return Err(StorageError::CorruptPage(format!(
                "page {page}: key {key} outside separator range {lower:?}..{upper:?}"
            )));
        }

        if !is_root && node.num_keys() < self.layout.min_keys(node.kind()) {
            return Err(StorageError::CorruptPage(format!(
                "page {page}: {} keys, minimum is {}",
                node.num_keys(),
                self.layout.min_keys(node.kind())
            )));
        }

        if node.is_leaf() {
            stats.leaves += 1;
            stats.keys += node.num_keys();
            leaves.push((page, node.next_leaf()));
            match *leaf_depth {
                Some(expected) if expected != depth => {
                    return Err(StorageError::CorruptPage(format!(
                        "leaf {page} at depth {depth}, others at {expected}"
                    )));
                }
                Some(_) => {}
                None => *leaf_depth = Some(depth),
            }
            return Ok(());
        }

        stats.internal_nodes += 1;
        if node.num_children() != node.num_keys() + 1 {
            return Err(StorageError::CorruptPage(format!(
                "page {page}: {} keys but {} children",
                node.num_keys(),
                node.num_children()
            )));
        }

        for (i, &child) in node.children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { node.key(i - 1) };
            let child_upper = if i == node.num_keys() { upper } else { node.key(i) };
            self.check_subtree(
                child,
                depth + 1,
                (child_lower, child_upper),
                false,
                stats,
                leaves,
                leaf_depth,
            )?;
        }

        Ok(())
    }
}

/// Move the last entry of `left` to the front of `right` through separator
/// `separator` of `parent`.
fn rotate_right(parent: &mut Node, separator: usize, left: &mut Node, right: &mut Node) -> Result<()> {
    if left.is_leaf() {
        let (key, value) = left
            .remove_cell(left.num_keys().wrapping_sub(1))
            .ok_or_else(|| empty_sibling("left"))?;
        right.insert_cell(0, key, value);
        parent.keys[separator] = key;
    } else {
        let (Some(key), Some(child)) = (left.keys.pop(), left.children.pop()) else {
            return Err(empty_sibling("left"));
        };
        right.keys.insert(0, parent.keys[separator]);
        right.children.insert(0, child);
        parent.keys[separator] = key;
    }
    Ok(())
}

/// Move the first entry of `right` to the end of `left` through separator
/// `separator` of `parent`.
fn rotate_left(parent: &mut Node, separator: usize, left: &mut Node, right: &mut Node) -> Result<()> {
    if right.is_leaf() {
        let (key, value) = right.remove_cell(0).ok_or_else(|| empty_sibling("right"))?;
        left.insert_cell(left.num_keys(), key, value);
        parent.keys[separator] = right.key(0).ok_or_else(|| empty_sibling("right"))?;
    } else {
        if right.keys.is_empty() || right.children.is_empty() {
            return Err(empty_sibling("right"));
        }
        left.keys.push(parent.keys[separator]);
        left.children.push(right.children.remove(0));
        parent.keys[separator] = right.keys.remove(0);
    }
    Ok(())
}

/// Fold `right` into `left` and drop separator `separator` (and the pointer
/// to `right`) from `parent`.
fn merge(parent: &mut Node, separator: usize, left: &mut Node, right: Node) -> Result<()> {
    if separator >= parent.num_keys() {
        return Err(StorageError::CorruptPage(format!(
            "merge at separator {separator} of {}",
            parent.num_keys()
        )));
    }
    let key = parent.keys.remove(separator);
    parent.children.remove(separator + 1);

    if left.is_leaf() {
        left.keys.extend(right.keys);
        left.values.extend(right.values);
        left.next_leaf = right.next_leaf;
    } else {
        left.keys.push(key);
        left.keys.extend(right.keys);
        left.children.extend(right.children);
    }
    Ok(())
}

fn empty_sibling(side: &str) -> StorageError {
    StorageError::CorruptPage(format!("{side} sibling has nothing to lend"))
}
