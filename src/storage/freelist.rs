/// On-disk free list: a singly-linked LIFO of reclaimed pages.
///
/// Each free page stores the next free id right after its LSN slot. The
/// list head lives in the file header; push prepends, pop returns the head.
use crate::error::{Error, Result};
use crate::storage::page::{get_u64, put_u64, PageId, FREELIST_NEXT_OFFSET, PAGE_CONTENT_OFFSET};
use crate::storage::pager::{Page, Pager};

/// Zero the page, thread it onto the list, and release it.
pub fn push(pager: &mut Pager, page: Page) -> Result<()> {
    if page.id().is_root() {
        return Err(Error::Logic("cannot push the header page onto the free list".into()));
    }
    debug_assert!(page.is_writable());
    let zeros = vec![0u8; pager.page_size() - PAGE_CONTENT_OFFSET];
    pager.write(&page, PAGE_CONTENT_OFFSET, &zeros)?;
    let mut next = [0u8; 8];
    put_u64(&mut next, 0, pager.freelist_head().0);
    pager.write(&page, FREELIST_NEXT_OFFSET, &next)?;
    pager.set_freelist_head(page.id());
    pager.release(page)
}

/// Detach and return the head page. Not-found when the list is empty.
pub fn pop(pager: &mut Pager) -> Result<Page> {
    let head = pager.freelist_head();
    if head.is_null() {
        return Err(Error::NotFound("free list is empty".into()));
    }
    let mut page = pager.acquire(head)?;
    pager.upgrade(&mut page);
    let next = PageId(get_u64(pager.data(&page), FREELIST_NEXT_OFFSET));
    pager.write(&page, FREELIST_NEXT_OFFSET, &[0u8; 8])?;
    pager.set_freelist_head(next);
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, MemEnv, SharedEnv};
    use crate::storage::header::FileHeader;
    use crate::wal::writer::{SyncMode, WalWriter};
    use std::sync::Arc;

    fn open_pager(env: &MemEnv) -> Pager {
        let shared: SharedEnv = Arc::new(env.clone());
        let header = FileHeader::new(512);
        let mut page = vec![0u8; 512];
        header.encode(&mut page);
        let mut file = shared.open_editor("/test.db").unwrap();
        crate::env::FileEditor::write_at(file.as_mut(), 0, &page).unwrap();
        let wal = WalWriter::open(shared.clone(), "/test.db-wal-", 1 << 20, 1, SyncMode::Normal);
        Pager::open(&shared, "/test.db", wal, &header, 16, SyncMode::Normal).unwrap()
    }

    #[test]
    fn pop_on_empty_list_is_not_found() {
        let env = MemEnv::new();
        let mut pager = open_pager(&env);
        let err = pop(&mut pager).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn push_then_pop_returns_the_same_page() {
        let env = MemEnv::new();
        let mut pager = open_pager(&env);

        let page = pager.allocate().unwrap();
        let pid = page.id();
        pager.destroy(page).unwrap();
        assert_eq!(pager.freelist_head(), pid);

        let page = pop(&mut pager).unwrap();
        assert_eq!(page.id(), pid);
        assert!(pager.freelist_head().is_null());
        pager.release(page).unwrap();
    }

    #[test]
    fn pop_order_is_lifo() {
        let env = MemEnv::new();
        let mut pager = open_pager(&env);

        let mut pids = Vec::new();
        for _ in 0..3 {
            let page = pager.allocate().unwrap();
            pids.push(page.id());
            pager.release(page).unwrap();
        }
        for &pid in &pids {
            let page = pager.acquire(pid).unwrap();
            pager.destroy(page).unwrap();
        }
        // Most recently pushed comes back first.
        for &pid in pids.iter().rev() {
            let page = pop(&mut pager).unwrap();
            assert_eq!(page.id(), pid);
            pager.release(page).unwrap();
        }
        assert!(pager.freelist_head().is_null());
    }

    #[test]
    fn pushed_pages_are_zeroed_except_the_next_pointer() {
        let env = MemEnv::new();
        let mut pager = open_pager(&env);

        let page = pager.allocate().unwrap();
        let pid = page.id();
        pager.write(&page, 32, &[0xFF; 16]).unwrap();
        pager.release(page).unwrap();

        let page = pager.acquire(pid).unwrap();
        let mut page = page;
        pager.upgrade(&mut page);
        pager.destroy(page).unwrap();

        let page = pager.acquire(pid).unwrap();
        let data = pager.data(&page);
        assert!(data[FREELIST_NEXT_OFFSET + 8..].iter().all(|&b| b == 0));
        pager.release(page).unwrap();
    }

    #[test]
    fn allocation_reuses_freed_pages_before_extending() {
        let env = MemEnv::new();
        let mut pager = open_pager(&env);

        let a = pager.allocate().unwrap();
        let a_id = a.id();
        pager.release(a).unwrap();
        let b = pager.allocate().unwrap();
        pager.release(b).unwrap();
        assert_eq!(pager.page_count(), 3);

        let a = pager.acquire(a_id).unwrap();
        pager.destroy(a).unwrap();
        let reused = pager.allocate().unwrap();
        assert_eq!(reused.id(), a_id);
        assert_eq!(pager.page_count(), 3);
        pager.release(reused).unwrap();
    }
}
