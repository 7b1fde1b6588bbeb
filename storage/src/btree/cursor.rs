use super::{BTree, Node, NodeKind, PathFrame, MAX_DEPTH};
use crate::page::PageNum;
use crate::{Result, StorageError};
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeStart,
    At(usize),
    AtEnd,
}

/// Ordered traversal over a [`BTree`].
///
/// The cursor keeps the internal-node path down to its current leaf, so it can
/// step backwards without back links. The path decides which leaf comes next in
/// both directions; stepping forward only checks the persisted sibling link
/// against it and reports a mismatch as `CorruptPage`.
///
/// It borrows the tree mutably (page loads go through the cache), which also
/// keeps the tree from being modified underneath it.
pub struct Cursor<'a> {
    tree: &'a mut BTree,
    path: Vec<PathFrame>,
    leaf_page: PageNum,
    leaf: Node,
    position: Position,
}

impl<'a> Cursor<'a> {
    pub(super) fn new(tree: &'a mut BTree) -> Result<Self> {
        let leaf_page = tree.root_page();
        let mut cursor = Self {
            tree,
            path: Vec::new(),
            leaf_page,
            leaf: Node::new(NodeKind::Leaf),
            position: Position::BeforeStart,
        };
        cursor.seek_first()?;
        Ok(cursor)
    }

    /// Position at the first key `>= key`, or at the end if there is none.
    pub fn seek(&mut self, key: u64) -> Result<()> {
        self.descend_from_root(|node| node.child_index(key))?;
        let index = self.leaf.lower_bound(key);
        self.settle_forward(index)
    }

    pub fn seek_first(&mut self) -> Result<()> {
        self.descend_from_root(|_| 0)?;
        self.settle_forward(0)
    }

    pub fn seek_last(&mut self) -> Result<()> {
        self.descend_from_root(rightmost)?;
        self.settle_backward()
    }

    pub fn next(&mut self) -> Result<()> {
        match self.position {
            Position::BeforeStart => self.seek_first(),
            Position::At(index) => self.settle_forward(index + 1),
            Position::AtEnd => Ok(()),
        }
    }

    pub fn prev(&mut self) -> Result<()> {
        match self.position {
            Position::AtEnd => self.seek_last(),
            Position::At(0) => {
                if self.retreat_leaf()? {
                    self.settle_backward()
                } else {
                    self.position = Position::BeforeStart;
                    Ok(())
                }
            }
            Position::At(index) => {
                self.position = Position::At(index - 1);
                Ok(())
            }
            Position::BeforeStart => Ok(()),
        }
    }

    pub fn valid(&self) -> bool {
        matches!(self.position, Position::At(_))
    }

    pub fn key(&self) -> Option<u64> {
        match self.position {
            Position::At(index) => self.leaf.key(index),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self.position {
            Position::At(index) => self.leaf.value(index),
            _ => None,
        }
    }

    /// Move to `index` in the current leaf, or the first key of the following
    /// non-empty leaf if `index` is past the end.
    fn settle_forward(&mut self, mut index: usize) -> Result<()> {
        while index >= self.leaf.num_keys() {
            if !self.advance_leaf()? {
                self.position = Position::AtEnd;
                return Ok(());
            }
            index = 0;
        }
        self.position = Position::At(index);
        Ok(())
    }

    /// Move to the last key of the current leaf, or of the nearest non-empty
    /// leaf before it.
    fn settle_backward(&mut self) -> Result<()> {
        while self.leaf.num_keys() == 0 {
            if !self.retreat_leaf()? {
                self.position = Position::BeforeStart;
                return Ok(());
            }
        }
        self.position = Position::At(self.leaf.num_keys() - 1);
        Ok(())
    }

    /// Step the path to the next leaf, then require the old leaf's sibling
    /// link to name that same page.
    fn advance_leaf(&mut self) -> Result<bool> {
        let link = self.leaf.next_leaf();
        let from = self.leaf_page;
        let moved = self.step_path(true)?;

        let by_path = moved.then_some(self.leaf_page);
        if link != by_path {
            return Err(StorageError::CorruptPage(format!(
                "leaf {from} links to {link:?}, tree order continues at {by_path:?}"
            )));
        }
        Ok(moved)
    }

    fn retreat_leaf(&mut self) -> Result<bool> {
        self.step_path(false)
    }

    /// Move the path to the adjacent leaf in key order. Returns false (with
    /// the path exhausted) when there is none.
    fn step_path(&mut self, forward: bool) -> Result<bool> {
        while let Some(frame) = self.path.pop() {
            let node = self.tree.load_node(frame.page)?;
            let index = if forward {
                Some(frame.index + 1).filter(|&i| i < node.num_children())
            } else {
                frame.index.checked_sub(1)
            };

            if let Some(index) = index {
                let child = child_of(&node, frame.page, index)?;
                self.path.push(PathFrame {
                    page: frame.page,
                    index,
                });
                if forward {
                    self.descend(child, |_| 0)?;
                } else {
                    self.descend(child, rightmost)?;
                }
                trace!("cursor moved to leaf {}", self.leaf_page);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn descend_from_root(&mut self, pick: impl Fn(&Node) -> usize) -> Result<()> {
        self.path.clear();
        let root = self.tree.root_page();
        self.descend(root, pick)
    }

    /// Walk down from `page`, choosing children with `pick`, and make the
    /// leaf reached the current one.
    fn descend(&mut self, mut page: PageNum, pick: impl Fn(&Node) -> usize) -> Result<()> {
        loop {
            let node = self.tree.load_node(page)?;
            if node.is_leaf() {
                self.leaf_page = page;
                self.leaf = node;
                return Ok(());
            }

            let index = pick(&node);
            let child = child_of(&node, page, index)?;
            self.path.push(PathFrame { page, index });
            if self.path.len() >= MAX_DEPTH {
                return Err(StorageError::CorruptPage(format!(
                    "tree deeper than {MAX_DEPTH} levels"
                )));
            }
            page = child;
        }
    }
}

fn rightmost(node: &Node) -> usize {
    node.num_children().saturating_sub(1)
}

fn child_of(node: &Node, page: PageNum, index: usize) -> Result<PageNum> {
    node.child(index).ok_or_else(|| {
        StorageError::CorruptPage(format!("page {page}: no child at index {index}"))
    })
}
