//! On-page layout of B-tree nodes.
//!
//! ```text
//! header (8 bytes)
//!   [0]     kind: u8          1 = leaf, 2 = internal
//!   [1..3]  cell count: u16
//!   [3..7]  link: u32         leaf: next sibling (0 = none)
//!                             internal: rightmost child
//!   [7]     reserved
//!
//! leaf cell      [key: u64][value length: u16][value slot: value_size bytes]
//! internal cell  [key: u64][child: u32]
//! ```
//!
//! All integers are little-endian. Internal cell `i` holds separator `k_i` and
//! child `c_i`; every key under `c_i` is below `k_i`, and keys equal to a
//! separator live to its right.

use crate::page::PageNum;
use crate::{Result, StorageError};
use bytes::{Buf, BufMut};

pub const NODE_HEADER_SIZE: usize = 8;

/// Key + value length prefix.
pub const LEAF_CELL_OVERHEAD: usize = 10;

/// Key + child page number.
pub const INTERNAL_CELL_SIZE: usize = 12;

/// Fewer cells than this per node would make splits degenerate.
pub const MIN_CELLS_PER_NODE: usize = 3;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf = 1,
    Internal = 2,
}

impl TryFrom<u8> for NodeKind {
    type Error = StorageError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(NodeKind::Leaf),
            2 => Ok(NodeKind::Internal),
            other => Err(StorageError::CorruptPage(format!(
                "unknown node kind {other}"
            ))),
        }
    }
}

/// Capacity rules derived from the page size and the leaf value width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    page_size: usize,
    value_size: usize,
}

impl NodeLayout {
    pub fn new(page_size: usize, value_size: usize) -> Result<Self> {
        if value_size > u16::MAX as usize {
            return Err(StorageError::InvalidConfig(format!(
                "value size {value_size} exceeds {}",
                u16::MAX
            )));
        }
        if page_size <= NODE_HEADER_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "page size {page_size} cannot hold a node header"
            )));
        }

        let layout = Self {
            page_size,
            value_size,
        };

        if layout.leaf_max_cells() < MIN_CELLS_PER_NODE {
            return Err(StorageError::InvalidConfig(format!(
                "page size {page_size} fits {} leaf cells of {} bytes, need {MIN_CELLS_PER_NODE}",
                layout.leaf_max_cells(),
                layout.leaf_cell_size()
            )));
        }
        if layout.internal_max_keys() < MIN_CELLS_PER_NODE {
            return Err(StorageError::InvalidConfig(format!(
                "page size {page_size} fits {} internal cells, need {MIN_CELLS_PER_NODE}",
                layout.internal_max_keys()
            )));
        }

        Ok(layout)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn leaf_cell_size(&self) -> usize {
        LEAF_CELL_OVERHEAD + self.value_size
    }

    pub fn leaf_max_cells(&self) -> usize {
        (self.page_size - NODE_HEADER_SIZE) / self.leaf_cell_size()
    }

    pub fn internal_max_keys(&self) -> usize {
        (self.page_size - NODE_HEADER_SIZE) / INTERNAL_CELL_SIZE
    }

    pub fn leaf_min_cells(&self) -> usize {
        self.leaf_max_cells() / 2
    }

    pub fn internal_min_keys(&self) -> usize {
        self.internal_max_keys() / 2
    }

    pub fn max_keys(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_max_cells(),
            NodeKind::Internal => self.internal_max_keys(),
        }
    }

    pub fn min_keys(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_min_cells(),
            NodeKind::Internal => self.internal_min_keys(),
        }
    }
}

/// Decoded contents of one node page.
///
/// Leaves use `keys`/`values`/`next_leaf`; internal nodes use `keys` and
/// `children`, where `children.len() == keys.len() + 1` and the last child is
/// the rightmost pointer. An internal node fresh from [`Node::new`] has no
/// children yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub(super) kind: NodeKind,
    pub(super) keys: Vec<u64>,
    pub(super) values: Vec<Vec<u8>>,
    pub(super) children: Vec<PageNum>,
    pub(super) next_leaf: Option<PageNum>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: None,
        }
    }

    /// Internal node with a single separator, as produced by a root split.
    pub(super) fn new_root(left: PageNum, separator: u64, right: PageNum) -> Self {
        Self {
            kind: NodeKind::Internal,
            keys: vec![separator],
            values: Vec::new(),
            children: vec![left, right],
            next_leaf: None,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    pub fn key(&self, index: usize) -> Option<u64> {
        self.keys.get(index).copied()
    }

    /// Child `index`; `index == num_keys()` is the rightmost child.
    pub fn child(&self, index: usize) -> Option<PageNum> {
        self.children.get(index).copied()
    }

    pub fn value(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).map(Vec::as_slice)
    }

    pub fn next_leaf(&self) -> Option<PageNum> {
        self.next_leaf
    }

    pub fn set_next_leaf(&mut self, next: Option<PageNum>) {
        self.next_leaf = next;
    }

    /// Exact-match search: `Ok(index)` if present, else the insert position.
    pub fn search(&self, key: u64) -> std::result::Result<usize, usize> {
        self.keys.binary_search(&key)
    }

    /// Index of the first key `>= key`.
    pub fn lower_bound(&self, key: u64) -> usize {
        self.keys.partition_point(|&k| k < key)
    }

    /// Child to descend into for `key`: the number of separators `<= key`.
    pub fn child_index(&self, key: u64) -> usize {
        self.keys.partition_point(|&k| k <= key)
    }

    pub fn insert_cell(&mut self, index: usize, key: u64, value: Vec<u8>) {
        self.keys.insert(index, key);
        self.values.insert(index, value);
    }

    pub fn remove_cell(&mut self, index: usize) -> Option<(u64, Vec<u8>)> {
        if index >= self.keys.len() {
            return None;
        }
        Some((self.keys.remove(index), self.values.remove(index)))
    }

    /// Move the upper half of an overfull leaf into a new right sibling.
    /// Sibling links are left to the caller.
    pub(super) fn split_leaf(&mut self) -> Node {
        let at = self.keys.len() / 2;
        let mut right = Node::new(NodeKind::Leaf);
        right.keys = self.keys.split_off(at);
        right.values = self.values.split_off(at);
        right
    }

    /// Split an overfull internal node around its middle key, which moves up
    /// to the parent instead of staying in either half.
    pub(super) fn split_internal(&mut self) -> Result<(u64, Node)> {
        let mid = self.keys.len() / 2;
        let mut right = Node::new(NodeKind::Internal);
        right.keys = self.keys.split_off(mid + 1);
        right.children = self.children.split_off(mid + 1);
        let promoted = self.keys.pop().ok_or_else(|| {
            StorageError::CorruptPage("split of an internal node without keys".to_string())
        })?;
        Ok((promoted, right))
    }

    pub fn serialize(&self, layout: &NodeLayout) -> Result<Vec<u8>> {
        let max = layout.max_keys(self.kind);
        if self.keys.len() > max {
            return Err(StorageError::CorruptPage(format!(
                "{:?} node with {} cells exceeds capacity {}",
                self.kind,
                self.keys.len(),
                max
            )));
        }

        let link = match self.kind {
            NodeKind::Leaf => self.next_leaf.unwrap_or(0),
            NodeKind::Internal => self.children.last().copied().unwrap_or(0),
        };

        let mut page = vec![0u8; layout.page_size()];
        let mut out = &mut page[..];
        out.put_u8(self.kind as u8);
        out.put_u16_le(self.keys.len() as u16);
        out.put_u32_le(link);
        out.put_u8(0);

        match self.kind {
            NodeKind::Leaf => {
                for (key, value) in self.keys.iter().zip(&self.values) {
                    if value.len() > layout.value_size() {
                        return Err(StorageError::ValueTooLarge {
                            len: value.len(),
                            max: layout.value_size(),
                        });
                    }
                    out.put_u64_le(*key);
                    out.put_u16_le(value.len() as u16);
                    out.put_slice(value);
                    out.put_bytes(0, layout.value_size() - value.len());
                }
            }
            NodeKind::Internal => {
                for (key, child) in self.keys.iter().zip(&self.children) {
                    out.put_u64_le(*key);
                    out.put_u32_le(*child);
                }
            }
        }

        Ok(page)
    }

    pub fn deserialize(layout: &NodeLayout, data: &[u8]) -> Result<Node> {
        if data.len() != layout.page_size() {
            return Err(StorageError::SizeMismatch {
                expected: layout.page_size(),
                actual: data.len(),
            });
        }

        let mut input = data;
        let kind = NodeKind::try_from(input.get_u8())?;
        let count = input.get_u16_le() as usize;
        let link = input.get_u32_le();
        input.advance(1);

        let max = layout.max_keys(kind);
        if count > max {
            return Err(StorageError::CorruptPage(format!(
                "{kind:?} node declares {count} cells, page fits {max}"
            )));
        }

        let mut node = Node::new(kind);
        node.keys.reserve(count);

        match kind {
            NodeKind::Leaf => {
                node.values.reserve(count);
                for _ in 0..count {
                    let key = input.get_u64_le();
                    let len = input.get_u16_le() as usize;
                    if len > layout.value_size() {
                        return Err(StorageError::CorruptPage(format!(
                            "value length {len} exceeds slot width {}",
                            layout.value_size()
                        )));
                    }
                    node.keys.push(key);
                    node.values.push(input[..len].to_vec());
                    input.advance(layout.value_size());
                }
                node.next_leaf = (link != 0).then_some(link);
            }
            NodeKind::Internal => {
                node.children.reserve(count + 1);
                for _ in 0..count {
                    node.keys.push(input.get_u64_le());
                    node.children.push(input.get_u32_le());
                }
                if count > 0 || link != 0 {
                    node.children.push(link);
                }
                if node.children.contains(&0) {
                    return Err(StorageError::CorruptPage(
                        "internal node points at the header page".to_string(),
                    ));
                }
            }
        }

        if node.keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(StorageError::CorruptPage(
                "keys are not strictly ascending".to_string(),
            ));
        }

        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn small_layout() -> NodeLayout {
        // (96 - 8) / 18 = 4 leaf cells, (96 - 8) / 12 = 7 internal keys
        NodeLayout::new(96, 8).unwrap()
    }

    fn leaf_with(keys: &[u64]) -> Node {
        let mut node = Node::new(NodeKind::Leaf);
        for (i, &key) in keys.iter().enumerate() {
            node.insert_cell(i, key, key.to_le_bytes()[..2].to_vec());
        }
        node
    }

    #[test]
    fn test_layout_capacity_for_rows() {
        let layout = NodeLayout::new(4096, crate::row::ROW_SIZE).unwrap();

        assert_eq!(layout.leaf_cell_size(), 305);
        assert_eq!(layout.leaf_max_cells(), 13);
        assert_eq!(layout.leaf_min_cells(), 6);
        assert_eq!(layout.internal_max_keys(), 340);
        assert_eq!(layout.internal_min_keys(), 170);
    }

    #[test]
    fn test_layout_rejects_too_few_cells() {
        assert!(matches!(
            NodeLayout::new(64, 100).unwrap_err(),
            StorageError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_new_node_is_empty() {
        let node = Node::new(NodeKind::Leaf);

        assert!(node.is_leaf());
        assert_eq!(node.num_keys(), 0);
        assert_eq!(node.key(0), None);
        assert_eq!(node.child(0), None);
        assert_eq!(node.next_leaf(), None);
    }

    #[test]
    fn test_leaf_roundtrip() {
        let layout = small_layout();
        let mut node = leaf_with(&[3, 9, 27]);
        node.set_next_leaf(Some(12));

        let bytes = node.serialize(&layout).unwrap();
        assert_eq!(bytes.len(), 96);

        let decoded = Node::deserialize(&layout, &bytes).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.value(1), Some(&9u64.to_le_bytes()[..2]));
    }

    #[test]
    fn test_internal_roundtrip() {
        let layout = small_layout();
        let mut node = Node::new_root(4, 100, 5);
        node.keys.push(200);
        node.children.push(6);

        let decoded = Node::deserialize(&layout, &node.serialize(&layout).unwrap()).unwrap();

        assert_eq!(decoded, node);
        assert!(!decoded.is_leaf());
        assert_eq!(decoded.child(2), Some(6));
        assert_eq!(decoded.child(3), None);
    }

    #[test]
    fn test_empty_nodes_roundtrip() {
        let layout = small_layout();
        for kind in [NodeKind::Leaf, NodeKind::Internal] {
            let node = Node::new(kind);
            let decoded = Node::deserialize(&layout, &node.serialize(&layout).unwrap()).unwrap();
            assert_eq!(decoded, node);
        }
    }

    #[test]
    fn test_routing_sends_equal_keys_right() {
        let mut node = Node::new_root(1, 10, 2);
        node.keys.push(20);
        node.children.push(3);

        assert_eq!(node.child_index(5), 0);
        assert_eq!(node.child_index(10), 1);
        assert_eq!(node.child_index(19), 1);
        assert_eq!(node.child_index(20), 2);
        assert_eq!(node.child_index(u64::MAX), 2);
    }

    #[test]
    fn test_search_and_lower_bound() {
        let node = leaf_with(&[2, 4, 6]);

        assert_eq!(node.search(4), Ok(1));
        assert_eq!(node.search(5), Err(2));
        assert_eq!(node.lower_bound(5), 2);
        assert_eq!(node.lower_bound(7), 3);
        assert_eq!(node.lower_bound(0), 0);
    }

    #[test]
    fn test_split_leaf_moves_upper_half() {
        let mut left = leaf_with(&[1, 2, 3, 4, 5]);
        let right = left.split_leaf();

        assert_eq!(left.keys(), &[1, 2]);
        assert_eq!(right.keys(), &[3, 4, 5]);
        assert_eq!(right.values.len(), 3);
    }

    #[test]
    fn test_split_internal_promotes_middle() {
        let mut node = Node::new(NodeKind::Internal);
        node.keys = vec![10, 20, 30, 40, 50];
        node.children = vec![1, 2, 3, 4, 5, 6];

        let (promoted, right) = node.split_internal().unwrap();

        assert_eq!(promoted, 30);
        assert_eq!(node.keys(), &[10, 20]);
        assert_eq!(node.children, vec![1, 2, 3]);
        assert_eq!(right.keys(), &[40, 50]);
        assert_eq!(right.children, vec![4, 5, 6]);
    }

    #[test]
    fn test_deserialize_rejects_overfull_count() {
        let layout = small_layout();
        let mut bytes = leaf_with(&[1]).serialize(&layout).unwrap();
        bytes[1..3].copy_from_slice(&50u16.to_le_bytes());

        assert!(matches!(
            Node::deserialize(&layout, &bytes).unwrap_err(),
            StorageError::CorruptPage(_)
        ));
    }

    #[test]
    fn test_deserialize_rejects_unknown_kind() {
        let layout = small_layout();
        let bytes = vec![0u8; 96];

        assert!(matches!(
            Node::deserialize(&layout, &bytes).unwrap_err(),
            StorageError::CorruptPage(_)
        ));
    }

    #[test]
    fn test_deserialize_rejects_unsorted_keys() {
        let layout = small_layout();
        let mut node = leaf_with(&[1, 2]);
        node.keys = vec![2, 1];
        let bytes = node.serialize(&layout).unwrap();

        assert!(matches!(
            Node::deserialize(&layout, &bytes).unwrap_err(),
            StorageError::CorruptPage(_)
        ));
    }

    #[test]
    fn test_deserialize_rejects_value_longer_than_slot() {
        let layout = small_layout();
        let mut bytes = leaf_with(&[1]).serialize(&layout).unwrap();
        // First cell: key at 8..16, value length at 16..18.
        bytes[16..18].copy_from_slice(&9u16.to_le_bytes());

        assert!(matches!(
            Node::deserialize(&layout, &bytes).unwrap_err(),
            StorageError::CorruptPage(reason) if reason.contains("slot width")
        ));
    }

    #[test]
    fn test_deserialize_rejects_child_zero() {
        let layout = small_layout();
        let mut bytes = Node::new_root(4, 100, 5).serialize(&layout).unwrap();
        // First cell: key at 8..16, child at 16..20.
        bytes[16..20].copy_from_slice(&0u32.to_le_bytes());

        assert!(matches!(
            Node::deserialize(&layout, &bytes).unwrap_err(),
            StorageError::CorruptPage(reason) if reason.contains("header page")
        ));
    }

    #[test]
    fn test_deserialize_rejects_wrong_length() {
        let layout = small_layout();

        assert!(matches!(
            Node::deserialize(&layout, &[1u8; 10]).unwrap_err(),
            StorageError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_serialize_rejects_long_value() {
        let layout = small_layout();
        let mut node = Node::new(NodeKind::Leaf);
        node.insert_cell(0, 1, vec![0u8; 9]);

        assert!(matches!(
            node.serialize(&layout).unwrap_err(),
            StorageError::ValueTooLarge { len: 9, max: 8 }
        ));
    }
}
