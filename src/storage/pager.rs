/// Buffered page cache over the data file.
///
/// The pager owns a fixed pool of frames, the two-tier page registry, and
/// the WAL writer. Mutation goes through `upgrade` + `write`, which capture
/// the pre-image and record byte-range deltas; the write-through discipline
/// guarantees that a dirty page never reaches the data file before every
/// WAL record describing it is durable.
use log::debug;

use crate::env::{Env, FileEditor, FileReader, SharedEnv};
use crate::error::{Error, Result};
use crate::storage::delta::{compress_deltas, insert_delta, PageDelta};
use crate::storage::freelist;
use crate::storage::header::FileHeader;
use crate::storage::page::{put_u64, Lsn, PageId, PAGE_LSN_OFFSET};
use crate::storage::registry::{CacheStats, PageRegistry};
use crate::wal::record::DeltaEntry;
use crate::wal::writer::{SyncMode, WalWriter};

pub const MIN_FRAME_COUNT: usize = 16;

/// A pinned page handle. Must be passed back to `Pager::release` (or
/// `Pager::destroy`) on every path.
#[derive(Debug)]
pub struct Page {
    pid: PageId,
    frame: usize,
    writable: bool,
}

impl Page {
    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

struct Frame {
    buf: Vec<u8>,
    pid: PageId,
    pins: u32,
    dirty: bool,
    lsn: Lsn,
    deltas: Vec<PageDelta>,
    pre_image: Option<Vec<u8>>,
}

impl Frame {
    fn new(page_size: usize) -> Frame {
        Frame {
            buf: vec![0u8; page_size],
            pid: PageId::NULL,
            pins: 0,
            dirty: false,
            lsn: 0,
            deltas: Vec::new(),
            pre_image: None,
        }
    }

    fn reset(&mut self) {
        self.buf.fill(0);
        self.pid = PageId::NULL;
        self.pins = 0;
        self.dirty = false;
        self.lsn = 0;
        self.deltas.clear();
        self.pre_image = None;
    }
}

pub struct Pager {
    file: Box<dyn FileEditor>,
    wal: WalWriter,
    frames: Vec<Frame>,
    unused: Vec<usize>,
    registry: PageRegistry,
    page_size: usize,
    page_count: u64,
    freelist_head: PageId,
    sync_mode: SyncMode,
}

impl Pager {
    pub fn open(
        env: &SharedEnv,
        db_path: &str,
        wal: WalWriter,
        header: &FileHeader,
        frame_count: usize,
        sync_mode: SyncMode,
    ) -> Result<Pager> {
        let frame_count = frame_count.max(MIN_FRAME_COUNT);
        let file = env.open_editor(db_path)?;
        let frames: Vec<Frame> = (0..frame_count)
            .map(|_| Frame::new(header.page_size))
            .collect();
        let unused = (0..frame_count).rev().collect();
        Ok(Pager {
            file,
            wal,
            frames,
            unused,
            registry: PageRegistry::new(),
            page_size: header.page_size,
            page_count: header.page_count,
            freelist_head: header.freelist_head,
            sync_mode,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn freelist_head(&self) -> PageId {
        self.freelist_head
    }

    pub(crate) fn set_freelist_head(&mut self, head: PageId) {
        self.freelist_head = head;
    }

    /// Drop trailing pages during vacuum. The caller is responsible for the
    /// file-level truncation after the shrink is committed.
    pub fn truncate(&mut self, new_count: u64) {
        debug_assert!(new_count >= 1 && new_count <= self.page_count);
        self.page_count = new_count;
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.registry.stats()
    }

    pub fn wal_next_lsn(&self) -> Lsn {
        self.wal.next_lsn()
    }

    /// Pin the page into a frame, reading it from the data file on a cache
    /// miss. Fails with `Busy` when every frame is pinned.
    pub fn acquire(&mut self, pid: PageId) -> Result<Page> {
        if pid.is_null() || pid.0 > self.page_count {
            return Err(Error::Corruption(format!(
                "page id {pid} out of range (page count {})",
                self.page_count
            )));
        }
        if let Some(frame) = self.registry.get(pid) {
            self.frames[frame].pins += 1;
            return Ok(Page {
                pid,
                frame,
                writable: false,
            });
        }
        let frame = self.grab_frame()?;
        {
            let buf = &mut self.frames[frame].buf;
            buf.fill(0);
            // Short read past EOF leaves the tail zeroed: the page was
            // allocated but never written back.
            match self.file.read_at(pid.file_offset(self.page_size), buf) {
                Ok(n) => debug_assert!(n <= self.page_size),
                Err(err) => {
                    // Hand the frame back before surfacing the failure.
                    self.unused.push(frame);
                    return Err(err);
                }
            }
        }
        let slot = &mut self.frames[frame];
        slot.pid = pid;
        slot.pins = 1;
        slot.lsn = if pid.is_root() {
            0
        } else {
            crate::storage::page::get_u64(&slot.buf, PAGE_LSN_OFFSET)
        };
        self.registry.put(pid, frame);
        Ok(Page {
            pid,
            frame,
            writable: false,
        })
    }

    /// Unpin. Deltas stay on the frame until the next flush point.
    pub fn release(&mut self, page: Page) -> Result<()> {
        let frame = &mut self.frames[page.frame];
        if frame.pid != page.pid || frame.pins == 0 {
            return Err(Error::Logic(format!("release of stale page handle {}", page.pid)));
        }
        frame.pins -= 1;
        Ok(())
    }

    /// Prepare a page for mutation: snapshot the pre-image if this is the
    /// page's first modification since the last flush point.
    pub fn upgrade(&mut self, page: &mut Page) {
        let frame = &mut self.frames[page.frame];
        if frame.deltas.is_empty() && frame.pre_image.is_none() {
            frame.pre_image = Some(frame.buf.clone());
        }
        page.writable = true;
    }

    /// Copy bytes into the frame and record the modified range.
    pub fn write(&mut self, page: &Page, offset: usize, data: &[u8]) -> Result<()> {
        if !page.writable {
            return Err(Error::Logic(format!(
                "write to page {} without upgrade",
                page.pid
            )));
        }
        if offset + data.len() > self.page_size {
            return Err(Error::Logic(format!(
                "write past the end of page {}",
                page.pid
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        let frame = &mut self.frames[page.frame];
        debug_assert!(page.pid.is_root() || offset >= PAGE_LSN_OFFSET + 8);
        frame.buf[offset..offset + data.len()].copy_from_slice(data);
        insert_delta(&mut frame.deltas, PageDelta::new(offset, data.len()));
        frame.dirty = true;
        Ok(())
    }

    /// Read access to the pinned page's bytes.
    pub fn data(&self, page: &Page) -> &[u8] {
        debug_assert_eq!(self.frames[page.frame].pid, page.pid);
        &self.frames[page.frame].buf
    }

    /// Allocate a page: reuse the free list head when one exists, otherwise
    /// extend the file. The returned handle is writable.
    pub fn allocate(&mut self) -> Result<Page> {
        if !self.freelist_head.is_null() {
            let mut page = freelist::pop(self)?;
            self.upgrade(&mut page);
            return Ok(page);
        }
        let frame = self.grab_frame()?;
        self.page_count += 1;
        let pid = PageId(self.page_count);
        let slot = &mut self.frames[frame];
        slot.pid = pid;
        slot.pins = 1;
        self.registry.put(pid, frame);
        let mut page = Page {
            pid,
            frame,
            writable: false,
        };
        self.upgrade(&mut page);
        Ok(page)
    }

    /// Zero the page and push it onto the free list.
    pub fn destroy(&mut self, mut page: Page) -> Result<()> {
        if page.pid.is_root() {
            return Err(Error::Logic("cannot destroy the header page".into()));
        }
        self.upgrade(&mut page);
        freelist::push(self, page)
    }

    /// Drop a resident page without writing it anywhere. Used by vacuum for
    /// pages that have been relocated.
    pub fn discard(&mut self, page: Page) -> Result<()> {
        let frame = &mut self.frames[page.frame];
        if frame.pid != page.pid || frame.pins == 0 {
            return Err(Error::Logic(format!("discard of stale page handle {}", page.pid)));
        }
        frame.pins -= 1;
        if frame.pins == 0 {
            self.registry.erase(page.pid);
            self.frames[page.frame].reset();
            self.unused.push(page.frame);
        }
        Ok(())
    }

    /// Drop the resident frame for a page that is about to disappear (the
    /// tail cut off by vacuum). No-op when the page is not cached.
    pub fn forget(&mut self, pid: PageId) {
        if let Some(fid) = self.registry.erase(pid) {
            debug_assert_eq!(self.frames[fid].pins, 0);
            self.frames[fid].reset();
            self.unused.push(fid);
        }
    }

    fn grab_frame(&mut self) -> Result<usize> {
        if let Some(frame) = self.unused.pop() {
            return Ok(frame);
        }
        // Oldest clean unpinned entry, warm tier before hot.
        let clean = {
            let frames = &self.frames;
            self.registry
                .eviction_candidates()
                .find(|&(pid, fid)| !pid.is_root() && frames[fid].pins == 0 && !frames[fid].dirty)
        };
        if let Some((pid, fid)) = clean {
            self.registry.erase(pid);
            self.frames[fid].reset();
            return Ok(fid);
        }
        // No clean victim: flush the oldest unpinned dirty frame, then evict.
        let dirty = {
            let frames = &self.frames;
            self.registry
                .eviction_candidates()
                .find(|&(pid, fid)| !pid.is_root() && frames[fid].pins == 0)
        };
        let Some((pid, fid)) = dirty else {
            return Err(Error::Busy("all frames are pinned".into()));
        };
        debug!("evicting dirty page {pid} under cache pressure");
        self.flush_frame(fid)?;
        self.registry.erase(pid);
        self.frames[fid].reset();
        Ok(fid)
    }

    /// Serialize the frame's pending deltas into a WAL record.
    fn emit_frame_record(&mut self, fid: usize) -> Result<()> {
        if self.frames[fid].deltas.is_empty() {
            return Ok(());
        }
        let pid = self.frames[fid].pid;
        compress_deltas(&mut self.frames[fid].deltas);
        let entries = {
            let frame = &self.frames[fid];
            let pre = frame.pre_image.as_ref().ok_or_else(|| {
                Error::Logic(format!("page {pid} has deltas but no pre-image"))
            })?;
            frame
                .deltas
                .iter()
                .map(|d| DeltaEntry {
                    offset: d.offset as u16,
                    before: pre[d.offset..d.offset + d.size].to_vec(),
                    after: frame.buf[d.offset..d.offset + d.size].to_vec(),
                })
                .collect::<Vec<_>>()
        };
        let lsn = self.wal.log_deltas(pid, &entries)?;
        let frame = &mut self.frames[fid];
        frame.lsn = lsn;
        if !pid.is_root() {
            put_u64(&mut frame.buf, PAGE_LSN_OFFSET, lsn);
        }
        frame.deltas.clear();
        frame.pre_image = None;
        Ok(())
    }

    /// WAL-fence and write one frame to the data file.
    fn flush_frame(&mut self, fid: usize) -> Result<()> {
        self.emit_frame_record(fid)?;
        let lsn = self.frames[fid].lsn;
        self.wal.flush_to(lsn)?;
        let offset = self.frames[fid].pid.file_offset(self.page_size);
        self.file.write_at(offset, &self.frames[fid].buf)?;
        self.frames[fid].dirty = false;
        Ok(())
    }

    /// Serialize every dirty frame's pending deltas into WAL records.
    pub fn emit_records(&mut self) -> Result<()> {
        for fid in 0..self.frames.len() {
            if !self.frames[fid].pid.is_null() && self.frames[fid].dirty {
                self.emit_frame_record(fid)?;
            }
        }
        Ok(())
    }

    /// Write dirty frames to the data file behind the WAL fence. The header
    /// page is withheld when `skip_header` is set; it goes out through
    /// `write_back_header` once the commit record is durable.
    pub fn write_back(&mut self, skip_header: bool) -> Result<()> {
        let fence = self
            .frames
            .iter()
            .filter(|f| !f.pid.is_null() && f.dirty)
            .map(|f| f.lsn)
            .max()
            .unwrap_or(0);
        self.wal.flush_to(fence)?;
        for fid in 0..self.frames.len() {
            let frame = &self.frames[fid];
            if frame.pid.is_null() || !frame.dirty {
                continue;
            }
            if skip_header && frame.pid.is_root() {
                continue;
            }
            debug_assert!(frame.deltas.is_empty());
            let offset = frame.pid.file_offset(self.page_size);
            self.file.write_at(offset, &self.frames[fid].buf)?;
            self.frames[fid].dirty = false;
        }
        Ok(())
    }

    pub fn write_back_header(&mut self) -> Result<()> {
        self.write_back(false)
    }

    /// Flush all dirty state: WAL records, fence, data-file writes.
    pub fn flush(&mut self) -> Result<()> {
        self.emit_records()?;
        self.write_back(false)
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.sync_mode != SyncMode::None {
            self.file.sync()?;
        }
        Ok(())
    }

    pub fn wal_commit(&mut self) -> Result<Lsn> {
        self.wal.commit()
    }

    pub fn wal_cleanup(&mut self, up_to: Lsn) -> Result<()> {
        self.wal.cleanup(up_to)
    }

    /// Abort path: drop every frame and rewind in-memory state to the given
    /// committed header. Uncommitted WAL records are left behind; recovery
    /// ignores them on the next open.
    pub fn discard_all(&mut self, header: &FileHeader) {
        self.registry = PageRegistry::new();
        self.unused = (0..self.frames.len()).rev().collect();
        for frame in &mut self.frames {
            frame.reset();
        }
        self.page_count = header.page_count;
        self.freelist_head = header.freelist_head;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, MemEnv, SharedEnv};
    use std::sync::Arc;

    const PAGE_SIZE: usize = 512;

    fn setup(env: &MemEnv) -> (SharedEnv, FileHeader) {
        let shared: SharedEnv = Arc::new(env.clone());
        let mut header = FileHeader::new(PAGE_SIZE);
        let mut page = vec![0u8; PAGE_SIZE];
        header.encode(&mut page);
        let mut file = shared.open_editor("/test.db").unwrap();
        file.write_at(0, &page).unwrap();
        file.sync().unwrap();
        (shared, header)
    }

    fn open_pager(shared: &SharedEnv, header: &FileHeader, frames: usize) -> Pager {
        let wal = WalWriter::open(
            shared.clone(),
            "/test.db-wal-",
            1 << 20,
            header.last_commit_lsn + 1,
            SyncMode::Normal,
        );
        Pager::open(shared, "/test.db", wal, header, frames, SyncMode::Normal).unwrap()
    }

    #[test]
    fn allocate_write_flush_reread() {
        let env = MemEnv::new();
        let (shared, mut header) = setup(&env);
        {
            let mut pager = open_pager(&shared, &header, 16);
            let page = pager.allocate().unwrap();
            assert_eq!(page.id(), PageId(2));
            pager.write(&page, 16, b"hello pager").unwrap();
            pager.release(page).unwrap();
            pager.flush().unwrap();
            pager.sync().unwrap();
            header.page_count = pager.page_count();
        }
        {
            let mut pager = open_pager(&shared, &header, 16);
            let page = pager.acquire(PageId(2)).unwrap();
            assert_eq!(&pager.data(&page)[16..27], b"hello pager");
            pager.release(page).unwrap();
        }
    }

    #[test]
    fn write_without_upgrade_is_a_logic_error() {
        let env = MemEnv::new();
        let (shared, header) = setup(&env);
        let mut pager = open_pager(&shared, &header, 16);
        let page = pager.allocate().unwrap();
        pager.release(page).unwrap();

        let page = pager.acquire(PageId(2)).unwrap();
        let err = pager.write(&page, 16, b"x").unwrap_err();
        assert!(matches!(err, Error::Logic(_)));
        pager.release(page).unwrap();
    }

    #[test]
    fn busy_when_every_frame_is_pinned() {
        let env = MemEnv::new();
        let (shared, header) = setup(&env);
        let mut pager = open_pager(&shared, &header, 16);

        let mut pinned = Vec::new();
        for _ in 0..16 {
            pinned.push(pager.allocate().unwrap());
        }
        let err = pager.allocate().unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        for page in pinned {
            pager.release(page).unwrap();
        }
        // With pins released, allocation works again.
        let page = pager.allocate().unwrap();
        pager.release(page).unwrap();
    }

    #[test]
    fn eviction_flushes_dirty_pages_through_the_wal() {
        let env = MemEnv::new();
        let (shared, header) = setup(&env);
        let mut pager = open_pager(&shared, &header, 16);

        // More dirty pages than frames; evictions must spill correctly.
        for i in 0..40u8 {
            let page = pager.allocate().unwrap();
            pager.write(&page, 16, &[i; 8]).unwrap();
            pager.release(page).unwrap();
        }
        for i in 0..40u8 {
            let page = pager.acquire(PageId(2 + i as u64)).unwrap();
            assert_eq!(&pager.data(&page)[16..24], &[i; 8], "page {}", 2 + i as u64);
            pager.release(page).unwrap();
        }
        // Evicted pages hit the WAL before the data file.
        let wal_files = env
            .list_children("/")
            .unwrap()
            .into_iter()
            .filter(|n| n.starts_with("test.db-wal-"))
            .count();
        assert!(wal_files > 0);
    }

    #[test]
    fn acquire_out_of_range_is_corruption() {
        let env = MemEnv::new();
        let (shared, header) = setup(&env);
        let mut pager = open_pager(&shared, &header, 16);
        assert!(matches!(pager.acquire(PageId(9)), Err(Error::Corruption(_))));
        assert!(matches!(pager.acquire(PageId::NULL), Err(Error::Corruption(_))));
    }

    #[test]
    fn discard_all_rewinds_state() {
        let env = MemEnv::new();
        let (shared, header) = setup(&env);
        let mut pager = open_pager(&shared, &header, 16);
        for _ in 0..3 {
            let page = pager.allocate().unwrap();
            pager.release(page).unwrap();
        }
        assert_eq!(pager.page_count(), 4);
        pager.discard_all(&header);
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.freelist_head(), PageId::NULL);
    }
}
