//! Ordered iteration over the tree's leaves.
//!
//! There is no leaf sibling pointer in this page layout, so advancing past
//! the end of one leaf means retracing from the root through the path
//! that was used to reach it — the same breadcrumb idea the teacher's
//! B-tree keeps for its own descent bookkeeping, reused here to drive a
//! forward cursor instead of a single locate/merge operation.

use crate::error::Error;
use crate::page::{InternalView, LeafView, NodeType, VALUE_SIZE, peek_node_type};
use crate::pager::Pager;

/// A breadcrumb is (internal node index, child position last descended
/// into from that node).
pub struct Cursor<'p> {
    pager: &'p mut Pager,
    breadcrumbs: Vec<(u32, usize)>,
    leaf: Option<(u32, usize)>,
}

impl<'p> Cursor<'p> {
    pub fn new(pager: &'p mut Pager, root: u32) -> Result<Self, Error> {
        let mut cursor = Self {
            pager,
            breadcrumbs: Vec::new(),
            leaf: None,
        };
        cursor.descend_leftmost(root)?;
        Ok(cursor)
    }

    fn descend_leftmost(&mut self, mut idx: u32) -> Result<(), Error> {
        loop {
            let node_type = {
                let buf = self.pager.page_by_idx(idx)?;
                peek_node_type(buf).expect("well-formed node type")
            };
            match node_type {
                NodeType::Leaf => {
                    self.leaf = Some((idx, 0));
                    return Ok(());
                }
                NodeType::Internal => {
                    self.breadcrumbs.push((idx, 0));
                    let buf = self.pager.page_by_idx(idx)?;
                    idx = InternalView::new(buf).cells()[0].child_idx;
                }
            }
        }
    }

    /// Moves to the next leaf in key order, or leaves the cursor
    /// exhausted if the rightmost leaf has already been visited.
    fn advance_leaf(&mut self) -> Result<(), Error> {
        while let Some((parent_idx, pos)) = self.breadcrumbs.pop() {
            let parent_cells = {
                let buf = self.pager.page_by_idx(parent_idx)?;
                InternalView::new(buf).cells_num() as usize
            };
            if pos + 1 < parent_cells {
                let next_child = {
                    let buf = self.pager.page_by_idx(parent_idx)?;
                    InternalView::new(buf).cells()[pos + 1].child_idx
                };
                self.breadcrumbs.push((parent_idx, pos + 1));
                return self.descend_leftmost(next_child);
            }
        }
        self.leaf = None;
        Ok(())
    }

    /// Returns the next `(key, value)` pair in ascending key order, or
    /// `None` once every leaf has been visited.
    pub fn next(&mut self) -> Result<Option<(u64, [u8; VALUE_SIZE])>, Error> {
        loop {
            let Some((leaf_idx, pos)) = self.leaf else {
                return Ok(None);
            };

            let (cells_num, cell) = {
                let buf = self.pager.page_by_idx(leaf_idx)?;
                let view = LeafView::new(buf);
                (view.cells_num() as usize, view.cells().get(pos).copied())
            };

            if pos < cells_num {
                self.leaf = Some((leaf_idx, pos + 1));
                let cell = cell.expect("pos < cells_num");
                return Ok(Some((cell.key, cell.value)));
            }

            self.advance_leaf()?;
            if self.leaf.is_none() {
                return Ok(None);
            }
        }
    }

    /// Collects every remaining `(key, value)` pair.
    pub fn collect_all(mut self) -> Result<Vec<(u64, [u8; VALUE_SIZE])>, Error> {
        let mut out = Vec::new();
        while let Some(pair) = self.next()? {
            out.push(pair);
        }
        Ok(out)
    }
}
