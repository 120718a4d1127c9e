/// B+-tree node layout over pages.
///
/// Node header, after the 8-byte page LSN slot:
///   flags (1) | cell count (2) | cell area start (2) | frag bytes (2) |
///   parent id (8) | external: prev id (8), next id (8)
///                 | internal: rightmost child id (8)
///
/// The cell pointer array grows up from the header; cell content grows down
/// from the end of the page. External cells hold
///   [key_len varint][value_len varint][key][local value][overflow id (8)?]
/// and internal cells hold
///   [child id (8)][key_len varint][key].
///
/// Keys always fit locally; a value whose cell would exceed the local
/// payload budget (a quarter page) spills its tail into an overflow chain.
use crate::error::{Error, Result};
use crate::storage::page::{get_u16, get_u64, put_u16, put_u64, PageId};
use crate::storage::pager::{Page, Pager};

const NODE_FLAGS: usize = 8;
const NODE_CELL_COUNT: usize = 9;
const NODE_CELL_AREA: usize = 11;
const NODE_FRAG: usize = 13;
const NODE_PARENT: usize = 15;
const NODE_PREV: usize = 23;
const NODE_NEXT: usize = 31;
const NODE_RIGHTMOST: usize = 23;

pub const EXTERNAL_HDR: usize = 39;
pub const INTERNAL_HDR: usize = 31;

const FLAG_EXTERNAL: u8 = 1;

/// Worst-case cell overhead: two 5-byte varints and an overflow id.
const MAX_CELL_OVERHEAD: usize = 18;

pub fn max_local(page_size: usize) -> usize {
    page_size / 4
}

pub fn max_key_len(page_size: usize) -> usize {
    max_local(page_size) - MAX_CELL_OVERHEAD
}

// --- varints (LEB128) ---

pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn encode_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn decode_varint(buf: &[u8]) -> (u64, usize) {
    let mut value = 0u64;
    let mut shift = 0;
    let mut used = 0;
    for &byte in buf {
        value |= u64::from(byte & 0x7F) << shift;
        used += 1;
        if byte < 0x80 {
            break;
        }
        shift += 7;
    }
    (value, used)
}

// --- cell codecs ---

/// How much of `value_len` stays inline next to a `key_len` key. Returns
/// (local length, spills).
pub fn local_value_len(page_size: usize, key_len: usize, value_len: usize) -> (usize, bool) {
    let hdr = varint_len(key_len as u64) + varint_len(value_len as u64);
    if hdr + key_len + value_len <= max_local(page_size) {
        (value_len, false)
    } else {
        (max_local(page_size) - hdr - key_len - 8, true)
    }
}

pub fn encode_external_cell(
    key: &[u8],
    value_len: usize,
    local_value: &[u8],
    overflow: PageId,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + key.len() + local_value.len() + 8);
    encode_varint(&mut buf, key.len() as u64);
    encode_varint(&mut buf, value_len as u64);
    buf.extend_from_slice(key);
    buf.extend_from_slice(local_value);
    if !overflow.is_null() {
        buf.extend_from_slice(&overflow.0.to_le_bytes());
    }
    buf
}

pub fn encode_internal_cell(child: PageId, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 5 + key.len());
    buf.extend_from_slice(&child.0.to_le_bytes());
    encode_varint(&mut buf, key.len() as u64);
    buf.extend_from_slice(key);
    buf
}

#[derive(Debug)]
pub struct ExternalCell<'a> {
    pub key: &'a [u8],
    pub local_value: &'a [u8],
    pub value_len: usize,
    pub overflow: PageId,
    pub size: usize,
}

pub fn parse_external_cell(page_size: usize, buf: &[u8]) -> ExternalCell<'_> {
    let (key_len, a) = decode_varint(buf);
    let (value_len, b) = decode_varint(&buf[a..]);
    let key_len = key_len as usize;
    let value_len = value_len as usize;
    let key_start = a + b;
    let key = &buf[key_start..key_start + key_len];
    let (local_len, spills) = local_value_len(page_size, key_len, value_len);
    let value_start = key_start + key_len;
    let local_value = &buf[value_start..value_start + local_len];
    let mut size = value_start + local_len;
    let overflow = if spills {
        let id = get_u64(buf, size);
        size += 8;
        PageId(id)
    } else {
        PageId::NULL
    };
    ExternalCell {
        key,
        local_value,
        value_len,
        overflow,
        size,
    }
}

#[derive(Debug)]
pub struct InternalCell<'a> {
    pub child: PageId,
    pub key: &'a [u8],
    pub size: usize,
}

pub fn parse_internal_cell(buf: &[u8]) -> InternalCell<'_> {
    let child = PageId(get_u64(buf, 0));
    let (key_len, a) = decode_varint(&buf[8..]);
    let key_len = key_len as usize;
    let key = &buf[8 + a..8 + a + key_len];
    InternalCell {
        child,
        key,
        size: 8 + a + key_len,
    }
}

/// An owned snapshot of one node page. Reads work on the copy; mutations
/// edit the copy and remember the touched byte ranges, which `flush` writes
/// back through the pager so the deltas stay small.
pub struct Node {
    pub pid: PageId,
    image: Vec<u8>,
    edits: Vec<(usize, usize)>,
}

impl Node {
    pub fn read(pager: &Pager, page: &Page) -> Node {
        Node {
            pid: page.id(),
            image: pager.data(page).to_vec(),
            edits: Vec::new(),
        }
    }

    pub fn new_external(pid: PageId, page_size: usize) -> Node {
        let mut node = Node {
            pid,
            image: vec![0u8; page_size],
            edits: Vec::new(),
        };
        node.edit(NODE_FLAGS, EXTERNAL_HDR - NODE_FLAGS);
        node.image[NODE_FLAGS] = FLAG_EXTERNAL;
        put_u16(&mut node.image, NODE_CELL_AREA, page_size as u16);
        node
    }

    pub fn new_internal(pid: PageId, page_size: usize) -> Node {
        let mut node = Node {
            pid,
            image: vec![0u8; page_size],
            edits: Vec::new(),
        };
        node.edit(NODE_FLAGS, INTERNAL_HDR - NODE_FLAGS);
        node.image[NODE_FLAGS] = 0;
        put_u16(&mut node.image, NODE_CELL_AREA, page_size as u16);
        node
    }

    /// Write the edited ranges back through the pager.
    pub fn flush(self, pager: &mut Pager, page: &Page) -> Result<()> {
        for (offset, len) in self.edits {
            pager.write(page, offset, &self.image[offset..offset + len])?;
        }
        Ok(())
    }

    fn edit(&mut self, offset: usize, len: usize) {
        self.edits.push((offset, len));
    }

    pub fn page_size(&self) -> usize {
        self.image.len()
    }

    pub fn is_external(&self) -> bool {
        self.image[NODE_FLAGS] & FLAG_EXTERNAL != 0
    }

    pub fn hdr_size(&self) -> usize {
        if self.is_external() {
            EXTERNAL_HDR
        } else {
            INTERNAL_HDR
        }
    }

    pub fn cell_count(&self) -> usize {
        get_u16(&self.image, NODE_CELL_COUNT) as usize
    }

    fn set_cell_count(&mut self, count: usize) {
        self.edit(NODE_CELL_COUNT, 2);
        put_u16(&mut self.image, NODE_CELL_COUNT, count as u16);
    }

    fn cell_area(&self) -> usize {
        // The area start is page_size when the node is empty; page_size can
        // be 32768 which still fits u16, but 65536 would not, and pages are
        // capped well below that.
        let raw = get_u16(&self.image, NODE_CELL_AREA) as usize;
        if raw == 0 {
            self.page_size()
        } else {
            raw
        }
    }

    fn set_cell_area(&mut self, offset: usize) {
        self.edit(NODE_CELL_AREA, 2);
        put_u16(&mut self.image, NODE_CELL_AREA, offset as u16);
    }

    fn frag_bytes(&self) -> usize {
        get_u16(&self.image, NODE_FRAG) as usize
    }

    fn set_frag_bytes(&mut self, frag: usize) {
        self.edit(NODE_FRAG, 2);
        put_u16(&mut self.image, NODE_FRAG, frag as u16);
    }

    pub fn parent(&self) -> PageId {
        PageId(get_u64(&self.image, NODE_PARENT))
    }

    pub fn set_parent(&mut self, parent: PageId) {
        self.edit(NODE_PARENT, 8);
        put_u64(&mut self.image, NODE_PARENT, parent.0);
    }

    pub fn prev_sibling(&self) -> PageId {
        debug_assert!(self.is_external());
        PageId(get_u64(&self.image, NODE_PREV))
    }

    pub fn set_prev_sibling(&mut self, pid: PageId) {
        debug_assert!(self.is_external());
        self.edit(NODE_PREV, 8);
        put_u64(&mut self.image, NODE_PREV, pid.0);
    }

    pub fn next_sibling(&self) -> PageId {
        debug_assert!(self.is_external());
        PageId(get_u64(&self.image, NODE_NEXT))
    }

    pub fn set_next_sibling(&mut self, pid: PageId) {
        debug_assert!(self.is_external());
        self.edit(NODE_NEXT, 8);
        put_u64(&mut self.image, NODE_NEXT, pid.0);
    }

    pub fn rightmost_child(&self) -> PageId {
        debug_assert!(!self.is_external());
        PageId(get_u64(&self.image, NODE_RIGHTMOST))
    }

    pub fn set_rightmost_child(&mut self, pid: PageId) {
        debug_assert!(!self.is_external());
        self.edit(NODE_RIGHTMOST, 8);
        put_u64(&mut self.image, NODE_RIGHTMOST, pid.0);
    }

    fn ptr_offset(&self, index: usize) -> usize {
        self.hdr_size() + 2 * index
    }

    fn cell_ptr(&self, index: usize) -> usize {
        get_u16(&self.image, self.ptr_offset(index)) as usize
    }

    fn cell_size_at(&self, offset: usize) -> usize {
        if self.is_external() {
            parse_external_cell(self.page_size(), &self.image[offset..]).size
        } else {
            parse_internal_cell(&self.image[offset..]).size
        }
    }

    pub fn cell_bytes(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.cell_count());
        let offset = self.cell_ptr(index);
        let size = self.cell_size_at(offset);
        &self.image[offset..offset + size]
    }

    pub fn external_cell(&self, index: usize) -> ExternalCell<'_> {
        debug_assert!(self.is_external());
        parse_external_cell(self.page_size(), &self.image[self.cell_ptr(index)..])
    }

    pub fn internal_cell(&self, index: usize) -> InternalCell<'_> {
        debug_assert!(!self.is_external());
        parse_internal_cell(&self.image[self.cell_ptr(index)..])
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        if self.is_external() {
            self.external_cell(index).key
        } else {
            self.internal_cell(index).key
        }
    }

    pub fn free_space(&self) -> usize {
        self.cell_area() - (self.hdr_size() + 2 * self.cell_count())
    }

    fn usable_space(&self) -> usize {
        self.free_space() + self.frag_bytes()
    }

    /// Bytes in use by cells and their pointers, excluding the header.
    pub fn content_bytes(&self) -> usize {
        (self.page_size() - self.cell_area()) - self.frag_bytes() + 2 * self.cell_count()
    }

    /// Occupancy below half of capacity triggers rebalancing.
    pub fn is_underfull(&self) -> bool {
        self.content_bytes() * 2 < self.page_size() - self.hdr_size()
    }

    /// Insert a cell at `index`. Returns false when it cannot fit even
    /// after defragmentation; the caller splits.
    pub fn insert_cell(&mut self, index: usize, cell: &[u8]) -> bool {
        debug_assert!(index <= self.cell_count());
        let needed = 2 + cell.len();
        if needed > self.free_space() {
            if needed > self.usable_space() {
                return false;
            }
            self.defragment();
        }
        let count = self.cell_count();
        let area = self.cell_area() - cell.len();
        self.image[area..area + cell.len()].copy_from_slice(cell);
        self.edit(area, cell.len());

        // Shift pointer entries right to open the slot.
        let start = self.ptr_offset(index);
        let end = self.ptr_offset(count);
        self.image.copy_within(start..end, start + 2);
        put_u16(&mut self.image, start, area as u16);
        self.edit(start, end - start + 2);

        self.set_cell_count(count + 1);
        self.set_cell_area(area);
        true
    }

    pub fn remove_cell(&mut self, index: usize) {
        let count = self.cell_count();
        debug_assert!(index < count);
        let offset = self.cell_ptr(index);
        let size = self.cell_size_at(offset);
        self.set_frag_bytes(self.frag_bytes() + size);

        let start = self.ptr_offset(index);
        let end = self.ptr_offset(count);
        self.image.copy_within(start + 2..end, start);
        self.edit(start, end - start - 2);
        self.set_cell_count(count - 1);
    }

    /// Overwrite the child id of an internal cell in place.
    pub fn set_cell_child(&mut self, index: usize, child: PageId) {
        debug_assert!(!self.is_external());
        let offset = self.cell_ptr(index);
        put_u64(&mut self.image, offset, child.0);
        self.edit(offset, 8);
    }

    /// Overwrite the overflow head id of an external cell in place.
    pub fn set_cell_overflow(&mut self, index: usize, overflow: PageId) {
        debug_assert!(self.is_external());
        let offset = self.cell_ptr(index);
        let cell = parse_external_cell(self.page_size(), &self.image[offset..]);
        debug_assert!(!cell.overflow.is_null());
        let id_offset = offset + cell.size - 8;
        put_u64(&mut self.image, id_offset, overflow.0);
        self.edit(id_offset, 8);
    }

    /// Rebuild the cell content area compactly, preserving pointer order.
    fn defragment(&mut self) {
        let count = self.cell_count();
        let cells: Vec<Vec<u8>> = (0..count).map(|i| self.cell_bytes(i).to_vec()).collect();
        let hdr = self.hdr_size();
        let mut area = self.page_size();
        for (i, cell) in cells.iter().enumerate() {
            area -= cell.len();
            self.image[area..area + cell.len()].copy_from_slice(cell);
            put_u16(&mut self.image, hdr + 2 * i, area as u16);
        }
        self.set_cell_area(area);
        self.set_frag_bytes(0);
        self.edit(self.hdr_size(), self.page_size() - self.hdr_size());
    }

    /// Binary search an external node. `Ok` holds the matching index, `Err`
    /// the insertion point.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        debug_assert!(self.is_external());
        let mut lo = 0;
        let mut hi = self.cell_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key_at(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Pick the subtree for `key`. Keys equal to a separator live in the
    /// child to its right. Returns the slot (None for the rightmost child)
    /// and the child id.
    pub fn choose_child(&self, key: &[u8]) -> (Option<usize>, PageId) {
        debug_assert!(!self.is_external());
        let mut lo = 0;
        let mut hi = self.cell_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.cell_count() {
            (Some(lo), self.internal_cell(lo).child)
        } else {
            (None, self.rightmost_child())
        }
    }

    /// Sanity checks used when a page is interpreted as a node.
    pub fn validate(&self) -> Result<()> {
        let hdr = self.hdr_size();
        let area = self.cell_area();
        if area < hdr + 2 * self.cell_count() || area > self.page_size() {
            return Err(Error::Corruption(format!(
                "node {} has an impossible cell layout",
                self.pid
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 512;

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64] {
            let mut buf = Vec::new();
            encode_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));
            let (decoded, used) = decode_varint(&buf);
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn external_cell_roundtrip_inline() {
        let cell = encode_external_cell(b"key", 5, b"value", PageId::NULL);
        let parsed = parse_external_cell(PAGE_SIZE, &cell);
        assert_eq!(parsed.key, b"key");
        assert_eq!(parsed.local_value, b"value");
        assert_eq!(parsed.value_len, 5);
        assert!(parsed.overflow.is_null());
        assert_eq!(parsed.size, cell.len());
    }

    #[test]
    fn external_cell_roundtrip_with_overflow() {
        let value_len = 1000;
        let (local, spills) = local_value_len(PAGE_SIZE, 3, value_len);
        assert!(spills);
        let local_bytes = vec![7u8; local];
        let cell = encode_external_cell(b"abc", value_len, &local_bytes, PageId(12));
        let parsed = parse_external_cell(PAGE_SIZE, &cell);
        assert_eq!(parsed.key, b"abc");
        assert_eq!(parsed.value_len, 1000);
        assert_eq!(parsed.local_value, &local_bytes[..]);
        assert_eq!(parsed.overflow, PageId(12));
        assert_eq!(parsed.size, cell.len());
    }

    #[test]
    fn internal_cell_roundtrip() {
        let cell = encode_internal_cell(PageId(77), b"sep");
        let parsed = parse_internal_cell(&cell);
        assert_eq!(parsed.child, PageId(77));
        assert_eq!(parsed.key, b"sep");
        assert_eq!(parsed.size, cell.len());
    }

    #[test]
    fn insert_and_search_sorted_cells() {
        let mut node = Node::new_external(PageId(2), PAGE_SIZE);
        for (i, key) in [b"b", b"d", b"f"].iter().enumerate() {
            let cell = encode_external_cell(*key, 1, b"x", PageId::NULL);
            assert!(node.insert_cell(i, &cell));
        }
        assert_eq!(node.cell_count(), 3);
        assert_eq!(node.search(b"b"), Ok(0));
        assert_eq!(node.search(b"d"), Ok(1));
        assert_eq!(node.search(b"a"), Err(0));
        assert_eq!(node.search(b"c"), Err(1));
        assert_eq!(node.search(b"z"), Err(3));
    }

    #[test]
    fn remove_then_reuse_space_via_defragment() {
        let mut node = Node::new_external(PageId(2), PAGE_SIZE);
        let cell = encode_external_cell(b"aa", 64, &[1u8; 64], PageId::NULL);
        let mut count = 0;
        while node.insert_cell(count, &cell) {
            count += 1;
        }
        assert!(count >= 4);
        // Free one slot, then a new cell must fit again via defragment.
        node.remove_cell(0);
        assert!(node.frag_bytes() > 0);
        assert!(node.insert_cell(0, &cell));
        assert_eq!(node.cell_count(), count);
    }

    #[test]
    fn choose_child_routes_equal_keys_right() {
        let mut node = Node::new_internal(PageId(2), PAGE_SIZE);
        node.set_rightmost_child(PageId(99));
        node.insert_cell(0, &encode_internal_cell(PageId(10), b"m"));
        node.insert_cell(1, &encode_internal_cell(PageId(20), b"t"));

        assert_eq!(node.choose_child(b"a"), (Some(0), PageId(10)));
        // Separator keys themselves live in the right subtree.
        assert_eq!(node.choose_child(b"m"), (Some(1), PageId(20)));
        assert_eq!(node.choose_child(b"s"), (Some(1), PageId(20)));
        assert_eq!(node.choose_child(b"t"), (None, PageId(99)));
        assert_eq!(node.choose_child(b"z"), (None, PageId(99)));
    }

    #[test]
    fn underfull_tracks_occupancy() {
        let mut node = Node::new_external(PageId(2), PAGE_SIZE);
        assert!(node.is_underfull());
        let cell = encode_external_cell(b"k", 100, &[9u8; 100], PageId::NULL);
        let mut i = 0;
        while node.insert_cell(i, &cell) {
            i += 1;
        }
        assert!(!node.is_underfull());
    }

    #[test]
    fn key_length_cap_leaves_room_for_overflow_id() {
        let page_size = 512;
        let key_len = max_key_len(page_size);
        let (local, spills) = local_value_len(page_size, key_len, 1 << 20);
        assert!(spills);
        // Even a maximal key with a huge value encodes without underflow.
        let _ = local;
    }
}
