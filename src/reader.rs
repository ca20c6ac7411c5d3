//! Read-only, zero-copy node views over the façade's persistent mmap.
//!
//! Reader transactions never touch the pager or the writer lock at all —
//! they search and iterate directly over the bytes of the long-lived
//! read-only mapping the database keeps for them (see `db.rs`), which is
//! remapped only when the file grows and only under an exclusive lock
//! that a reader's shared hold blocks for its whole lifetime. Because the
//! mapping can't change under a reader mid-transaction, failures here
//! (a page index pointing past well-formed data) indicate on-disk
//! corruption rather than a race, so this module panics rather than
//! returning a recoverable error.

use crate::page::{InternalView, LeafView, NodeType, VALUE_SIZE, peek_node_type};

pub struct MmapReader<'a> {
    data: &'a [u8],
    page_size: u32,
}

impl<'a> MmapReader<'a> {
    pub fn new(data: &'a [u8], page_size: u32) -> Self {
        Self { data, page_size }
    }

    fn page(&self, idx: u32) -> &'a [u8] {
        let start = idx as usize * self.page_size as usize;
        let end = start + self.page_size as usize;
        &self.data[start..end]
    }

    pub fn get(&self, root: u32, key: u64) -> Option<[u8; VALUE_SIZE]> {
        let mut idx = root;
        loop {
            let buf = self.page(idx);
            match peek_node_type(buf).expect("well-formed node type") {
                NodeType::Leaf => {
                    let view = LeafView::new(buf);
                    return match view.key_pos(key) {
                        Ok(pos) => Some(view.cells()[pos].value),
                        Err(_) => None,
                    };
                }
                NodeType::Internal => {
                    let view = InternalView::new(buf);
                    idx = view.cells()[view.child_for_key(key)].child_idx;
                }
            }
        }
    }

    pub fn exists(&self, root: u32, key: u64) -> bool {
        self.get(root, key).is_some()
    }

    pub fn cursor(&self, root: u32) -> ReadCursor<'a> {
        let mut cursor = ReadCursor {
            data: self.data,
            page_size: self.page_size,
            breadcrumbs: Vec::new(),
            leaf: None,
        };
        cursor.descend_leftmost(root);
        cursor
    }
}

pub struct ReadCursor<'a> {
    data: &'a [u8],
    page_size: u32,
    breadcrumbs: Vec<(u32, usize)>,
    leaf: Option<(u32, usize)>,
}

impl<'a> ReadCursor<'a> {
    fn page(&self, idx: u32) -> &'a [u8] {
        let start = idx as usize * self.page_size as usize;
        let end = start + self.page_size as usize;
        &self.data[start..end]
    }

    fn descend_leftmost(&mut self, mut idx: u32) {
        loop {
            let buf = self.page(idx);
            match peek_node_type(buf).expect("well-formed node type") {
                NodeType::Leaf => {
                    self.leaf = Some((idx, 0));
                    return;
                }
                NodeType::Internal => {
                    self.breadcrumbs.push((idx, 0));
                    idx = InternalView::new(buf).cells()[0].child_idx;
                }
            }
        }
    }

    fn advance_leaf(&mut self) {
        while let Some((parent_idx, pos)) = self.breadcrumbs.pop() {
            let parent_cells = InternalView::new(self.page(parent_idx)).cells_num() as usize;
            if pos + 1 < parent_cells {
                let next_child = InternalView::new(self.page(parent_idx)).cells()[pos + 1].child_idx;
                self.breadcrumbs.push((parent_idx, pos + 1));
                self.descend_leftmost(next_child);
                return;
            }
        }
        self.leaf = None;
    }

    pub fn next(&mut self) -> Option<(u64, [u8; VALUE_SIZE])> {
        loop {
            let (leaf_idx, pos) = self.leaf?;
            let view = LeafView::new(self.page(leaf_idx));
            if pos < view.cells_num() as usize {
                let cell = view.cells()[pos];
                self.leaf = Some((leaf_idx, pos + 1));
                return Some((cell.key, cell.value));
            }
            self.advance_leaf();
            self.leaf?;
        }
    }

    pub fn collect_all(mut self) -> Vec<(u64, [u8; VALUE_SIZE])> {
        let mut out = Vec::new();
        while let Some(pair) = self.next() {
            out.push(pair);
        }
        out
    }
}
