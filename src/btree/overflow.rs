/// Overflow chains: singly linked pages carrying a cell's spilled payload.
///
/// Page layout: LSN slot (8) | next page id (8) | payload bytes.
use crate::error::{Error, Result};
use crate::storage::page::{get_u64, PageId, PAGE_CONTENT_OFFSET};
use crate::storage::pager::Pager;

pub const OVERFLOW_NEXT_OFFSET: usize = PAGE_CONTENT_OFFSET;
pub const OVERFLOW_CONTENT_OFFSET: usize = PAGE_CONTENT_OFFSET + 8;

pub fn chain_capacity(page_size: usize) -> usize {
    page_size - OVERFLOW_CONTENT_OFFSET
}

/// Write `data` into a fresh chain and return its head id. At most two
/// pages are pinned at a time.
pub fn write_chain(pager: &mut Pager, data: &[u8]) -> Result<PageId> {
    debug_assert!(!data.is_empty());
    let capacity = chain_capacity(pager.page_size());
    let mut head = PageId::NULL;
    let mut prev = None;
    for chunk in data.chunks(capacity) {
        let page = pager.allocate()?;
        if head.is_null() {
            head = page.id();
        }
        if let Some(prev_page) = prev.take() {
            let mut next = [0u8; 8];
            next.copy_from_slice(&page.id().0.to_le_bytes());
            pager.write(&prev_page, OVERFLOW_NEXT_OFFSET, &next)?;
            pager.release(prev_page)?;
        }
        pager.write(&page, OVERFLOW_CONTENT_OFFSET, chunk)?;
        prev = Some(page);
    }
    if let Some(last) = prev {
        // Freshly allocated pages are zeroed, so the tail's next id is
        // already null.
        pager.release(last)?;
    }
    Ok(head)
}

/// Read `len` spilled bytes starting at `head` into `out`.
pub fn read_chain(pager: &mut Pager, head: PageId, len: usize, out: &mut Vec<u8>) -> Result<()> {
    let capacity = chain_capacity(pager.page_size());
    let mut remaining = len;
    let mut pid = head;
    while remaining > 0 {
        if pid.is_null() {
            return Err(Error::Corruption(
                "overflow chain ended before its payload".into(),
            ));
        }
        let page = pager.acquire(pid)?;
        let data = pager.data(&page);
        let take = remaining.min(capacity);
        out.extend_from_slice(&data[OVERFLOW_CONTENT_OFFSET..OVERFLOW_CONTENT_OFFSET + take]);
        let next = PageId(get_u64(data, OVERFLOW_NEXT_OFFSET));
        pager.release(page)?;
        remaining -= take;
        pid = next;
    }
    Ok(())
}

/// Return every page of the chain to the free list.
pub fn free_chain(pager: &mut Pager, head: PageId) -> Result<()> {
    let mut pid = head;
    while !pid.is_null() {
        let page = pager.acquire(pid)?;
        let next = PageId(get_u64(pager.data(&page), OVERFLOW_NEXT_OFFSET));
        pager.destroy(page)?;
        pid = next;
    }
    Ok(())
}

/// Walk the chain collecting page ids (vacuum bookkeeping).
pub fn chain_pages(pager: &mut Pager, head: PageId) -> Result<Vec<PageId>> {
    let mut pages = Vec::new();
    let mut pid = head;
    while !pid.is_null() {
        pages.push(pid);
        let page = pager.acquire(pid)?;
        let next = PageId(get_u64(pager.data(&page), OVERFLOW_NEXT_OFFSET));
        pager.release(page)?;
        pid = next;
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, FileEditor, MemEnv, SharedEnv};
    use crate::storage::header::FileHeader;
    use crate::storage::pager::Pager;
    use crate::wal::writer::{SyncMode, WalWriter};
    use std::sync::Arc;

    const PAGE_SIZE: usize = 512;

    fn open_pager(env: &MemEnv) -> Pager {
        let shared: SharedEnv = Arc::new(env.clone());
        let header = FileHeader::new(PAGE_SIZE);
        let mut page = vec![0u8; PAGE_SIZE];
        header.encode(&mut page);
        let mut file = shared.open_editor("/test.db").unwrap();
        file.write_at(0, &page).unwrap();
        let wal = WalWriter::open(shared.clone(), "/test.db-wal-", 1 << 20, 1, SyncMode::Normal);
        Pager::open(&shared, "/test.db", wal, &header, 16, SyncMode::Normal).unwrap()
    }

    #[test]
    fn chain_roundtrip_multiple_pages() {
        let env = MemEnv::new();
        let mut pager = open_pager(&env);

        let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let head = write_chain(&mut pager, &data).unwrap();
        assert!(!head.is_null());

        let mut out = Vec::new();
        read_chain(&mut pager, head, data.len(), &mut out).unwrap();
        assert_eq!(out, data);

        let pages = chain_pages(&mut pager, head).unwrap();
        let expected = data.len().div_ceil(chain_capacity(PAGE_SIZE));
        assert_eq!(pages.len(), expected);
    }

    #[test]
    fn free_chain_recycles_pages() {
        let env = MemEnv::new();
        let mut pager = open_pager(&env);

        let data = vec![0xABu8; 1500];
        let head = write_chain(&mut pager, &data).unwrap();
        let pages = chain_pages(&mut pager, head).unwrap();
        let count_before = pager.page_count();

        free_chain(&mut pager, head).unwrap();
        // Freed pages are reused before the file grows.
        for _ in 0..pages.len() {
            let page = pager.allocate().unwrap();
            assert!(pages.contains(&page.id()));
            pager.release(page).unwrap();
        }
        assert_eq!(pager.page_count(), count_before);
    }
}
