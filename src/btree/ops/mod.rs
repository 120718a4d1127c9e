/// B+-tree operations: search, insert with splits, erase with
/// redistribute/merge, and vacuum.
///
/// Nodes reference parents, siblings, children, and overflow chains by page
/// id only; a page id is the persistent identity, which is what lets vacuum
/// relocate pages by rewriting pointers.
use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::btree::node::{
    encode_external_cell, encode_internal_cell, local_value_len, parse_external_cell, Node,
};
use crate::btree::overflow;
use crate::error::{Error, Result};
use crate::storage::page::{get_u64, PageId, FREELIST_NEXT_OFFSET, PAGE_CONTENT_OFFSET};
use crate::storage::pager::{Page, Pager};

/// Depth guard against reference cycles on corrupted trees.
const MAX_DEPTH: usize = 64;

pub struct Tree {
    root: PageId,
    version: u64,
}

struct Split {
    sep: Vec<u8>,
    right: PageId,
}

pub(crate) fn read_node(pager: &mut Pager, pid: PageId) -> Result<Node> {
    let page = pager.acquire(pid)?;
    let node = Node::read(pager, &page);
    pager.release(page)?;
    node.validate()?;
    Ok(node)
}

pub(crate) fn write_node(pager: &mut Pager, node: Node) -> Result<()> {
    let mut page = pager.acquire(node.pid)?;
    pager.upgrade(&mut page);
    let result = node.flush(pager, &page);
    let released = pager.release(page);
    result.and(released)
}

/// Flush a freshly built node through the writable handle returned by
/// `Pager::allocate`.
fn write_new_node(pager: &mut Pager, page: Page, node: Node) -> Result<()> {
    debug_assert_eq!(page.id(), node.pid);
    let result = node.flush(pager, &page);
    let released = pager.release(page);
    result.and(released)
}

fn set_parent(pager: &mut Pager, child: PageId, parent: PageId) -> Result<()> {
    let mut node = read_node(pager, child)?;
    node.set_parent(parent);
    write_node(pager, node)
}

fn child_at(parent: &Node, pos: usize) -> PageId {
    if pos < parent.cell_count() {
        parent.internal_cell(pos).child
    } else {
        parent.rightmost_child()
    }
}

/// True when the node can lose its boundary cell and stay at least half
/// full.
fn can_donate(node: &Node, boundary: usize) -> bool {
    if node.cell_count() < 2 {
        return false;
    }
    let cost = node.cell_bytes(boundary).len() + 2;
    (node.content_bytes() - cost) * 2 >= node.page_size() - node.hdr_size()
}

impl Tree {
    pub fn open(root: PageId) -> Tree {
        Tree { root, version: 0 }
    }

    /// Resume with a version counter that invalidates older cursors.
    pub fn with_version(root: PageId, version: u64) -> Tree {
        Tree { root, version }
    }

    /// Allocate an empty root leaf.
    pub fn create(pager: &mut Pager) -> Result<Tree> {
        let mut tree = Tree::open(PageId::NULL);
        tree.ensure_root(pager)?;
        Ok(tree)
    }

    /// Allocate the root leaf if the tree is still empty.
    pub fn ensure_root(&mut self, pager: &mut Pager) -> Result<()> {
        if !self.root.is_null() {
            return Ok(());
        }
        let page = pager.allocate()?;
        let pid = page.id();
        let node = Node::new_external(pid, pager.page_size());
        write_new_node(pager, page, node)?;
        self.root = pid;
        self.version += 1;
        Ok(())
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Invalidate outstanding cursors, e.g. after an abort.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn get(&self, pager: &mut Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root.is_null() {
            return Ok(None);
        }
        let mut pid = self.root;
        for _ in 0..MAX_DEPTH {
            let node = read_node(pager, pid)?;
            if node.is_external() {
                return match node.search(key) {
                    Ok(index) => Ok(Some(read_value(pager, &node, index)?)),
                    Err(_) => Ok(None),
                };
            }
            pid = node.choose_child(key).1;
            if pid.is_null() {
                return Err(Error::Corruption("null child pointer in index node".into()));
            }
        }
        Err(Error::Corruption(
            "tree deeper than the maximum (possible cycle)".into(),
        ))
    }

    pub fn height(&self, pager: &mut Pager) -> Result<usize> {
        if self.root.is_null() {
            return Ok(0);
        }
        let mut height = 1;
        let mut pid = self.root;
        loop {
            let node = read_node(pager, pid)?;
            if node.is_external() {
                return Ok(height);
            }
            if height > MAX_DEPTH {
                return Err(Error::Corruption(
                    "tree deeper than the maximum (possible cycle)".into(),
                ));
            }
            pid = child_at(&node, 0);
            height += 1;
        }
    }

    /// Upsert. Returns true when the key was not present before.
    pub fn insert(&mut self, pager: &mut Pager, key: &[u8], value: &[u8]) -> Result<bool> {
        let root = self.root;
        let (added, split) = self.insert_at(pager, root, key, value, 0)?;
        if let Some(split) = split {
            let old_root = self.root;
            let page = pager.allocate()?;
            let new_root = page.id();
            let mut node = Node::new_internal(new_root, pager.page_size());
            node.set_rightmost_child(split.right);
            if !node.insert_cell(0, &encode_internal_cell(old_root, &split.sep)) {
                return Err(Error::Corruption("separator does not fit in a new root".into()));
            }
            write_new_node(pager, page, node)?;
            set_parent(pager, old_root, new_root)?;
            set_parent(pager, split.right, new_root)?;
            self.root = new_root;
            debug!("root split: new root {new_root}");
        }
        self.version += 1;
        Ok(added)
    }

    fn insert_at(
        &mut self,
        pager: &mut Pager,
        pid: PageId,
        key: &[u8],
        value: &[u8],
        depth: usize,
    ) -> Result<(bool, Option<Split>)> {
        if depth > MAX_DEPTH {
            return Err(Error::Corruption(
                "tree deeper than the maximum (possible cycle)".into(),
            ));
        }
        let node = read_node(pager, pid)?;
        if node.is_external() {
            return self.insert_external(pager, node, key, value);
        }
        let (slot, child) = node.choose_child(key);
        drop(node);
        let (added, split) = self.insert_at(pager, child, key, value, depth + 1)?;
        match split {
            Some(split) => {
                let up = self.insert_index_entry(pager, pid, slot, child, split)?;
                Ok((added, up))
            }
            None => Ok((added, None)),
        }
    }

    fn insert_external(
        &mut self,
        pager: &mut Pager,
        mut node: Node,
        key: &[u8],
        value: &[u8],
    ) -> Result<(bool, Option<Split>)> {
        let (index, added) = match node.search(key) {
            Ok(index) => {
                // Replace: drop the old cell and its spilled payload.
                let old_overflow = node.external_cell(index).overflow;
                node.remove_cell(index);
                if !old_overflow.is_null() {
                    overflow::free_chain(pager, old_overflow)?;
                }
                (index, false)
            }
            Err(index) => (index, true),
        };

        let (local_len, spills) = local_value_len(pager.page_size(), key.len(), value.len());
        let head = if spills {
            overflow::write_chain(pager, &value[local_len..])?
        } else {
            PageId::NULL
        };
        let cell = encode_external_cell(key, value.len(), &value[..local_len], head);

        if node.insert_cell(index, &cell) {
            write_node(pager, node)?;
            Ok((added, None))
        } else {
            let split = self.split_external(pager, node, index, cell)?;
            Ok((added, Some(split)))
        }
    }

    fn split_external(
        &mut self,
        pager: &mut Pager,
        node: Node,
        index: usize,
        cell: Vec<u8>,
    ) -> Result<Split> {
        let page_size = node.page_size();
        let left_pid = node.pid;
        let parent = node.parent();
        let prev = node.prev_sibling();
        let old_next = node.next_sibling();

        let mut cells: Vec<Vec<u8>> = (0..node.cell_count())
            .map(|i| node.cell_bytes(i).to_vec())
            .collect();
        cells.insert(index, cell);
        let mid = split_point(&cells).clamp(1, cells.len() - 1);
        let sep = parse_external_cell(page_size, &cells[mid]).key.to_vec();

        let right_page = pager.allocate()?;
        let right_pid = right_page.id();

        let mut left = Node::new_external(left_pid, page_size);
        left.set_parent(parent);
        left.set_prev_sibling(prev);
        left.set_next_sibling(right_pid);
        fill_cells(&mut left, &cells[..mid])?;

        let mut right = Node::new_external(right_pid, page_size);
        right.set_parent(parent);
        right.set_prev_sibling(left_pid);
        right.set_next_sibling(old_next);
        fill_cells(&mut right, &cells[mid..])?;

        write_new_node(pager, right_page, right)?;
        write_node(pager, left)?;
        if !old_next.is_null() {
            let mut next_node = read_node(pager, old_next)?;
            next_node.set_prev_sibling(right_pid);
            write_node(pager, next_node)?;
        }
        debug!("leaf {left_pid} split, new sibling {right_pid}");
        Ok(Split { sep, right: right_pid })
    }

    fn insert_index_entry(
        &mut self,
        pager: &mut Pager,
        pid: PageId,
        slot: Option<usize>,
        left_child: PageId,
        split: Split,
    ) -> Result<Option<Split>> {
        let mut node = read_node(pager, pid)?;
        let index = match slot {
            Some(index) => {
                // The slot that pointed at the split child now references
                // the right half; the new separator references the left.
                node.set_cell_child(index, split.right);
                index
            }
            None => {
                node.set_rightmost_child(split.right);
                node.cell_count()
            }
        };
        let cell = encode_internal_cell(left_child, &split.sep);
        if node.insert_cell(index, &cell) {
            write_node(pager, node)?;
            Ok(None)
        } else {
            self.split_internal(pager, node, index, cell).map(Some)
        }
    }

    fn split_internal(
        &mut self,
        pager: &mut Pager,
        node: Node,
        index: usize,
        cell: Vec<u8>,
    ) -> Result<Split> {
        let page_size = node.page_size();
        let left_pid = node.pid;
        let parent = node.parent();
        let rightmost = node.rightmost_child();

        let mut cells: Vec<Vec<u8>> = (0..node.cell_count())
            .map(|i| node.cell_bytes(i).to_vec())
            .collect();
        cells.insert(index, cell);
        let mid = split_point(&cells).clamp(1, cells.len() - 2);

        let promoted = crate::btree::node::parse_internal_cell(&cells[mid]);
        let promoted_child = promoted.child;
        let sep = promoted.key.to_vec();

        let right_page = pager.allocate()?;
        let right_pid = right_page.id();

        let mut left = Node::new_internal(left_pid, page_size);
        left.set_parent(parent);
        left.set_rightmost_child(promoted_child);
        fill_cells(&mut left, &cells[..mid])?;

        let mut right = Node::new_internal(right_pid, page_size);
        right.set_parent(parent);
        right.set_rightmost_child(rightmost);
        fill_cells(&mut right, &cells[mid + 1..])?;

        write_new_node(pager, right_page, right)?;
        write_node(pager, left)?;

        // Children handed to the right half need their parent pointers
        // rewritten.
        for moved in &cells[mid + 1..] {
            let child = crate::btree::node::parse_internal_cell(moved).child;
            set_parent(pager, child, right_pid)?;
        }
        set_parent(pager, rightmost, right_pid)?;
        debug!("index node {left_pid} split, new sibling {right_pid}");
        Ok(Split { sep, right: right_pid })
    }

    /// Remove a key. Returns false (not an error) when it is absent.
    pub fn erase(&mut self, pager: &mut Pager, key: &[u8]) -> Result<bool> {
        if self.root.is_null() {
            return Ok(false);
        }
        let root = self.root;
        let (removed, _) = self.erase_at(pager, root, key, 0)?;
        if removed {
            // An internal root left with a single child hands the root role
            // down, possibly through several levels.
            loop {
                let node = read_node(pager, self.root)?;
                if node.is_external() || node.cell_count() > 0 {
                    break;
                }
                let child = node.rightmost_child();
                let old_root = self.root;
                drop(node);
                set_parent(pager, child, PageId::NULL)?;
                let page = pager.acquire(old_root)?;
                pager.destroy(page)?;
                self.root = child;
                debug!("root collapsed into {child}");
            }
            self.version += 1;
        }
        Ok(removed)
    }

    fn erase_at(
        &mut self,
        pager: &mut Pager,
        pid: PageId,
        key: &[u8],
        depth: usize,
    ) -> Result<(bool, bool)> {
        if depth > MAX_DEPTH {
            return Err(Error::Corruption(
                "tree deeper than the maximum (possible cycle)".into(),
            ));
        }
        let mut node = read_node(pager, pid)?;
        if node.is_external() {
            return match node.search(key) {
                Err(_) => Ok((false, false)),
                Ok(index) => {
                    let head = node.external_cell(index).overflow;
                    node.remove_cell(index);
                    let underfull = node.is_underfull();
                    write_node(pager, node)?;
                    if !head.is_null() {
                        overflow::free_chain(pager, head)?;
                    }
                    Ok((true, underfull))
                }
            };
        }
        let (slot, child) = node.choose_child(key);
        drop(node);
        let (removed, child_underfull) = self.erase_at(pager, child, key, depth + 1)?;
        if !removed {
            return Ok((false, false));
        }
        if child_underfull {
            self.rebalance_child(pager, pid, slot)?;
        }
        let node = read_node(pager, pid)?;
        Ok((true, node.is_underfull()))
    }

    fn rebalance_child(
        &mut self,
        pager: &mut Pager,
        parent_pid: PageId,
        slot: Option<usize>,
    ) -> Result<()> {
        let parent = read_node(pager, parent_pid)?;
        let count = parent.cell_count();
        if count == 0 {
            return Ok(());
        }
        let pos = slot.unwrap_or(count);
        let child_pid = child_at(&parent, pos);
        {
            let child = read_node(pager, child_pid)?;
            if !child.is_underfull() {
                return Ok(());
            }
        }
        if pos > 0 {
            let donor = read_node(pager, child_at(&parent, pos - 1))?;
            if donor.cell_count() > 0 && can_donate(&donor, donor.cell_count() - 1) {
                return self.rotate_from_left(pager, parent, pos - 1);
            }
        }
        if pos < count {
            let donor = read_node(pager, child_at(&parent, pos + 1))?;
            if donor.cell_count() > 0 && can_donate(&donor, 0) {
                return self.rotate_from_right(pager, parent, pos);
            }
        }
        if pos > 0 {
            return self.merge_children(pager, parent, pos - 1);
        }
        self.merge_children(pager, parent, pos)
    }

    /// Move the left sibling's boundary cell into the child at
    /// `sep_idx + 1`. The parent separator at `sep_idx` is rewritten.
    fn rotate_from_left(&mut self, pager: &mut Pager, mut parent: Node, sep_idx: usize) -> Result<()> {
        let left_pid = parent.internal_cell(sep_idx).child;
        let target_pid = child_at(&parent, sep_idx + 1);
        let mut left = read_node(pager, left_pid)?;
        let mut target = read_node(pager, target_pid)?;
        let last = left.cell_count() - 1;

        let mut reparent = PageId::NULL;
        let new_sep = if target.is_external() {
            let cell = left.cell_bytes(last).to_vec();
            let new_sep = parse_external_cell(left.page_size(), &cell).key.to_vec();
            if !target.insert_cell(0, &cell) {
                return Ok(());
            }
            left.remove_cell(last);
            new_sep
        } else {
            let sep_key = parent.internal_cell(sep_idx).key.to_vec();
            let moved_child = left.rightmost_child();
            let boundary = left.internal_cell(last);
            let new_sep = boundary.key.to_vec();
            let new_rightmost = boundary.child;
            if !target.insert_cell(0, &encode_internal_cell(moved_child, &sep_key)) {
                return Ok(());
            }
            left.remove_cell(last);
            left.set_rightmost_child(new_rightmost);
            reparent = moved_child;
            new_sep
        };

        parent.remove_cell(sep_idx);
        if !parent.insert_cell(sep_idx, &encode_internal_cell(left_pid, &new_sep)) {
            // Discard the unwritten snapshots; the child stays underfull.
            return Ok(());
        }
        write_node(pager, left)?;
        write_node(pager, target)?;
        write_node(pager, parent)?;
        if !reparent.is_null() {
            set_parent(pager, reparent, target_pid)?;
        }
        self.version += 1;
        Ok(())
    }

    /// Move the right sibling's first cell into the child at `pos`. The
    /// parent separator at `pos` is rewritten.
    fn rotate_from_right(&mut self, pager: &mut Pager, mut parent: Node, pos: usize) -> Result<()> {
        let target_pid = parent.internal_cell(pos).child;
        let right_pid = child_at(&parent, pos + 1);
        let mut target = read_node(pager, target_pid)?;
        let mut right = read_node(pager, right_pid)?;

        let mut reparent = PageId::NULL;
        let new_sep = if target.is_external() {
            let cell = right.cell_bytes(0).to_vec();
            let end = target.cell_count();
            if !target.insert_cell(end, &cell) {
                return Ok(());
            }
            right.remove_cell(0);
            right.key_at(0).to_vec()
        } else {
            let sep_key = parent.internal_cell(pos).key.to_vec();
            let first = right.internal_cell(0);
            let moved_child = first.child;
            let new_sep = first.key.to_vec();
            let end = target.cell_count();
            let old_rightmost = target.rightmost_child();
            if !target.insert_cell(end, &encode_internal_cell(old_rightmost, &sep_key)) {
                return Ok(());
            }
            target.set_rightmost_child(moved_child);
            right.remove_cell(0);
            reparent = moved_child;
            new_sep
        };

        parent.remove_cell(pos);
        if !parent.insert_cell(pos, &encode_internal_cell(target_pid, &new_sep)) {
            return Ok(());
        }
        write_node(pager, target)?;
        write_node(pager, right)?;
        write_node(pager, parent)?;
        if !reparent.is_null() {
            set_parent(pager, reparent, target_pid)?;
        }
        self.version += 1;
        Ok(())
    }

    /// Merge the children on both sides of the separator at `sep_idx` into
    /// the left one, then drop the separator.
    fn merge_children(&mut self, pager: &mut Pager, mut parent: Node, sep_idx: usize) -> Result<()> {
        let left_pid = parent.internal_cell(sep_idx).child;
        let right_pid = child_at(&parent, sep_idx + 1);
        let left = read_node(pager, left_pid)?;
        let right = read_node(pager, right_pid)?;
        if left.is_external() != right.is_external() {
            return Err(Error::Corruption("sibling nodes disagree on their level".into()));
        }
        let page_size = left.page_size();
        let capacity = page_size - left.hdr_size();

        let mut reparent: Vec<PageId> = Vec::new();
        let merged = if left.is_external() {
            if left.content_bytes() + right.content_bytes() > capacity {
                return Ok(());
            }
            let mut merged = Node::new_external(left_pid, page_size);
            merged.set_parent(left.parent());
            merged.set_prev_sibling(left.prev_sibling());
            merged.set_next_sibling(right.next_sibling());
            let cells: Vec<Vec<u8>> = (0..left.cell_count())
                .map(|i| left.cell_bytes(i).to_vec())
                .chain((0..right.cell_count()).map(|i| right.cell_bytes(i).to_vec()))
                .collect();
            fill_cells(&mut merged, &cells)?;
            merged
        } else {
            let sep_cell = encode_internal_cell(
                left.rightmost_child(),
                parent.internal_cell(sep_idx).key,
            );
            if left.content_bytes() + right.content_bytes() + sep_cell.len() + 2 > capacity {
                return Ok(());
            }
            let mut merged = Node::new_internal(left_pid, page_size);
            merged.set_parent(left.parent());
            merged.set_rightmost_child(right.rightmost_child());
            let cells: Vec<Vec<u8>> = (0..left.cell_count())
                .map(|i| left.cell_bytes(i).to_vec())
                .chain(std::iter::once(sep_cell))
                .chain((0..right.cell_count()).map(|i| right.cell_bytes(i).to_vec()))
                .collect();
            fill_cells(&mut merged, &cells)?;
            for i in 0..right.cell_count() {
                reparent.push(right.internal_cell(i).child);
            }
            reparent.push(right.rightmost_child());
            merged
        };
        let next_leaf = if left.is_external() {
            right.next_sibling()
        } else {
            PageId::NULL
        };

        if sep_idx + 1 < parent.cell_count() {
            parent.set_cell_child(sep_idx + 1, left_pid);
        } else {
            parent.set_rightmost_child(left_pid);
        }
        parent.remove_cell(sep_idx);

        write_node(pager, merged)?;
        write_node(pager, parent)?;
        if !next_leaf.is_null() {
            let mut after = read_node(pager, next_leaf)?;
            after.set_prev_sibling(left_pid);
            write_node(pager, after)?;
        }
        for child in reparent {
            set_parent(pager, child, left_pid)?;
        }
        let page = pager.acquire(right_pid)?;
        pager.destroy(page)?;
        debug!("merged {right_pid} into {left_pid}");
        self.version += 1;
        Ok(())
    }
}

fn read_value(pager: &mut Pager, node: &Node, index: usize) -> Result<Vec<u8>> {
    let cell = node.external_cell(index);
    let total = cell.value_len;
    let head = cell.overflow;
    let mut value = cell.local_value.to_vec();
    if !head.is_null() {
        overflow::read_chain(pager, head, total - value.len(), &mut value)?;
    }
    Ok(value)
}

pub(crate) fn entry_value(pager: &mut Pager, node: &Node, index: usize) -> Result<Vec<u8>> {
    read_value(pager, node, index)
}

/// First index at which the accumulated cell bytes reach half of the total.
fn split_point(cells: &[Vec<u8>]) -> usize {
    let total: usize = cells.iter().map(|c| c.len() + 2).sum();
    let mut acc = 0;
    for (i, cell) in cells.iter().enumerate() {
        acc += cell.len() + 2;
        if acc * 2 >= total {
            return i + 1;
        }
    }
    cells.len()
}

fn fill_cells(node: &mut Node, cells: &[Vec<u8>]) -> Result<()> {
    for (i, cell) in cells.iter().enumerate() {
        if !node.insert_cell(i, cell) {
            return Err(Error::Corruption(
                "redistributed cells overflow their node".into(),
            ));
        }
    }
    Ok(())
}

// --- vacuum ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Internal,
    External,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Referrer {
    Root,
    Parent(PageId),
    LeafOverflowHead(PageId),
    OverflowNext(PageId),
}

impl Referrer {
    fn rename(&mut self, from: PageId, to: PageId) {
        let target = match self {
            Referrer::Root => return,
            Referrer::Parent(p) | Referrer::LeafOverflowHead(p) | Referrer::OverflowNext(p) => p,
        };
        if *target == from {
            *target = to;
        }
    }
}

impl Tree {
    /// Move the highest-numbered live pages into free-list holes and shrink
    /// the page count. Every pointer rewrite goes through the pager, so the
    /// whole pass is crash-safe once committed. Returns true when anything
    /// moved or the file shrank.
    pub fn vacuum(&mut self, pager: &mut Pager) -> Result<bool> {
        let mut free = BTreeSet::new();
        let mut pid = pager.freelist_head();
        while !pid.is_null() {
            if !free.insert(pid.0) {
                return Err(Error::Corruption("cycle in the free list".into()));
            }
            let page = pager.acquire(pid)?;
            let next = PageId(get_u64(pager.data(&page), FREELIST_NEXT_OFFSET));
            pager.release(page)?;
            pid = next;
        }
        if free.is_empty() {
            return Ok(false);
        }
        pager.set_freelist_head(PageId::NULL);
        let mut refs = self.reference_map(pager)?;

        loop {
            let end = pager.page_count();
            if end <= 1 {
                break;
            }
            if free.remove(&end) {
                pager.forget(PageId(end));
                pager.truncate(end - 1);
                continue;
            }
            let Some(&hole) = free.iter().next() else {
                break;
            };
            free.remove(&hole);
            self.relocate(pager, &mut refs, PageId(end), PageId(hole))?;
            pager.truncate(end - 1);
        }
        self.version += 1;
        Ok(true)
    }

    /// Map every live page to its kind and the single place that references
    /// it.
    fn reference_map(&self, pager: &mut Pager) -> Result<HashMap<u64, (PageKind, Referrer)>> {
        let mut refs = HashMap::new();
        if self.root.is_null() {
            return Ok(refs);
        }
        let mut stack = vec![(self.root, Referrer::Root)];
        while let Some((pid, referrer)) = stack.pop() {
            if refs.len() as u64 > pager.page_count() {
                return Err(Error::Corruption("more referenced pages than allocated".into()));
            }
            let node = read_node(pager, pid)?;
            if node.is_external() {
                refs.insert(pid.0, (PageKind::External, referrer));
                for i in 0..node.cell_count() {
                    let head = node.external_cell(i).overflow;
                    if head.is_null() {
                        continue;
                    }
                    let mut prev = PageId::NULL;
                    for opid in overflow::chain_pages(pager, head)? {
                        let r = if prev.is_null() {
                            Referrer::LeafOverflowHead(pid)
                        } else {
                            Referrer::OverflowNext(prev)
                        };
                        refs.insert(opid.0, (PageKind::Overflow, r));
                        prev = opid;
                    }
                }
            } else {
                refs.insert(pid.0, (PageKind::Internal, referrer));
                for i in 0..node.cell_count() {
                    stack.push((node.internal_cell(i).child, Referrer::Parent(pid)));
                }
                stack.push((node.rightmost_child(), Referrer::Parent(pid)));
            }
        }
        Ok(refs)
    }

    fn relocate(
        &mut self,
        pager: &mut Pager,
        refs: &mut HashMap<u64, (PageKind, Referrer)>,
        old: PageId,
        new: PageId,
    ) -> Result<()> {
        let Some((kind, referrer)) = refs.remove(&old.0) else {
            return Err(Error::Corruption(format!(
                "page {old} is neither free nor referenced"
            )));
        };
        debug!("vacuum: moving page {old} -> {new}");

        // Copy the page body.
        let src_page = pager.acquire(old)?;
        let src = pager.data(&src_page).to_vec();
        pager.discard(src_page)?;
        let mut dst = pager.acquire(new)?;
        pager.upgrade(&mut dst);
        pager.write(&dst, PAGE_CONTENT_OFFSET, &src[PAGE_CONTENT_OFFSET..])?;
        pager.release(dst)?;

        // Rewrite the single incoming pointer.
        match referrer {
            Referrer::Root => {
                self.root = new;
            }
            Referrer::Parent(parent_pid) => {
                let mut parent = read_node(pager, parent_pid)?;
                let mut found = false;
                for i in 0..parent.cell_count() {
                    if parent.internal_cell(i).child == old {
                        parent.set_cell_child(i, new);
                        found = true;
                        break;
                    }
                }
                if !found && parent.rightmost_child() == old {
                    parent.set_rightmost_child(new);
                    found = true;
                }
                if !found {
                    return Err(Error::Corruption(format!(
                        "parent {parent_pid} does not reference page {old}"
                    )));
                }
                write_node(pager, parent)?;
            }
            Referrer::LeafOverflowHead(leaf_pid) => {
                let mut leaf = read_node(pager, leaf_pid)?;
                let mut found = false;
                for i in 0..leaf.cell_count() {
                    if leaf.external_cell(i).overflow == old {
                        leaf.set_cell_overflow(i, new);
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(Error::Corruption(format!(
                        "leaf {leaf_pid} does not reference overflow page {old}"
                    )));
                }
                write_node(pager, leaf)?;
            }
            Referrer::OverflowNext(prev_pid) => {
                let mut prev = pager.acquire(prev_pid)?;
                pager.upgrade(&mut prev);
                pager.write(
                    &prev,
                    overflow::OVERFLOW_NEXT_OFFSET,
                    &new.0.to_le_bytes(),
                )?;
                pager.release(prev)?;
            }
        }

        // Fix back-pointers held by the pages the moved page points at.
        match kind {
            PageKind::Internal => {
                let node = read_node(pager, new)?;
                let mut children: Vec<PageId> =
                    (0..node.cell_count()).map(|i| node.internal_cell(i).child).collect();
                children.push(node.rightmost_child());
                drop(node);
                for child in children {
                    set_parent(pager, child, new)?;
                }
            }
            PageKind::External => {
                let node = read_node(pager, new)?;
                let prev = node.prev_sibling();
                let next = node.next_sibling();
                drop(node);
                if !prev.is_null() {
                    let mut sibling = read_node(pager, prev)?;
                    sibling.set_next_sibling(new);
                    write_node(pager, sibling)?;
                }
                if !next.is_null() {
                    let mut sibling = read_node(pager, next)?;
                    sibling.set_prev_sibling(new);
                    write_node(pager, sibling)?;
                }
            }
            PageKind::Overflow => {}
        }

        for (_, referrer) in refs.values_mut() {
            referrer.rename(old, new);
        }
        refs.insert(new.0, (kind, referrer));
        // The root may have been relocated above; referrer renames do not
        // cover it because it is not stored in the map.
        Ok(())
    }
}
