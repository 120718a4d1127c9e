/// Cursor positioning over the leaf chain.
///
/// A position is a leaf page id plus a cell index. Navigation crosses
/// sibling links; empty leaves (only the transient root can be one) are
/// skipped. Structural changes invalidate outstanding positions via the
/// tree's version counter, which the database facade checks before using a
/// saved position.
use crate::btree::node::Node;
use crate::btree::ops::{entry_value, read_node, Tree};
use crate::error::{Error, Result};
use crate::storage::page::PageId;
use crate::storage::pager::Pager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPos {
    pub leaf: PageId,
    pub index: usize,
}

fn leftmost_leaf(pager: &mut Pager, mut pid: PageId) -> Result<Node> {
    loop {
        let node = read_node(pager, pid)?;
        if node.is_external() {
            return Ok(node);
        }
        pid = if node.cell_count() > 0 {
            node.internal_cell(0).child
        } else {
            node.rightmost_child()
        };
    }
}

fn rightmost_leaf(pager: &mut Pager, mut pid: PageId) -> Result<Node> {
    loop {
        let node = read_node(pager, pid)?;
        if node.is_external() {
            return Ok(node);
        }
        pid = node.rightmost_child();
    }
}

/// Walk forward from (leaf, index) to the first leaf slot holding a cell.
fn normalize_forward(pager: &mut Pager, mut node: Node, mut index: usize) -> Result<Option<CursorPos>> {
    for _ in 0..=pager.page_count() {
        if index < node.cell_count() {
            return Ok(Some(CursorPos { leaf: node.pid, index }));
        }
        let next = node.next_sibling();
        if next.is_null() {
            return Ok(None);
        }
        node = read_node(pager, next)?;
        index = 0;
    }
    Err(Error::Corruption("cycle in the leaf sibling chain".into()))
}

impl Tree {
    pub fn first_pos(&self, pager: &mut Pager) -> Result<Option<CursorPos>> {
        if self.root().is_null() {
            return Ok(None);
        }
        let node = leftmost_leaf(pager, self.root())?;
        normalize_forward(pager, node, 0)
    }

    pub fn last_pos(&self, pager: &mut Pager) -> Result<Option<CursorPos>> {
        if self.root().is_null() {
            return Ok(None);
        }
        let mut node = rightmost_leaf(pager, self.root())?;
        for _ in 0..=pager.page_count() {
            if node.cell_count() > 0 {
                return Ok(Some(CursorPos {
                    leaf: node.pid,
                    index: node.cell_count() - 1,
                }));
            }
            let prev = node.prev_sibling();
            if prev.is_null() {
                return Ok(None);
            }
            node = read_node(pager, prev)?;
        }
        Err(Error::Corruption("cycle in the leaf sibling chain".into()))
    }

    /// Position at the first entry with key >= `key`.
    pub fn seek_pos(&self, pager: &mut Pager, key: &[u8]) -> Result<Option<CursorPos>> {
        if self.root().is_null() {
            return Ok(None);
        }
        let mut pid = self.root();
        let node = loop {
            let node = read_node(pager, pid)?;
            if node.is_external() {
                break node;
            }
            pid = node.choose_child(key).1;
        };
        let index = match node.search(key) {
            Ok(index) => index,
            Err(index) => index,
        };
        normalize_forward(pager, node, index)
    }

    pub fn next_pos(&self, pager: &mut Pager, pos: CursorPos) -> Result<Option<CursorPos>> {
        let node = read_node(pager, pos.leaf)?;
        normalize_forward(pager, node, pos.index + 1)
    }

    pub fn prev_pos(&self, pager: &mut Pager, pos: CursorPos) -> Result<Option<CursorPos>> {
        let mut node = read_node(pager, pos.leaf)?;
        let mut index = pos.index;
        for _ in 0..=pager.page_count() {
            if index > 0 {
                return Ok(Some(CursorPos {
                    leaf: node.pid,
                    index: index - 1,
                }));
            }
            let prev = node.prev_sibling();
            if prev.is_null() {
                return Ok(None);
            }
            node = read_node(pager, prev)?;
            index = node.cell_count();
        }
        Err(Error::Corruption("cycle in the leaf sibling chain".into()))
    }

    /// The key/value pair at a normalized position.
    pub fn entry_at(&self, pager: &mut Pager, pos: CursorPos) -> Result<(Vec<u8>, Vec<u8>)> {
        let node = read_node(pager, pos.leaf)?;
        if pos.index >= node.cell_count() {
            return Err(Error::NotFound("cursor position no longer exists".into()));
        }
        let key = node.external_cell(pos.index).key.to_vec();
        let value = entry_value(pager, &node, pos.index)?;
        Ok((key, value))
    }
}
