//! CalicoDB: an embedded, transactional, single-writer key/value store.
//!
//! The storage core is a disk-resident B+-tree over a buffered page cache,
//! with a segmented write-ahead log providing commit durability and
//! page-level crash recovery:
//! - pager with a two-tier (hot/warm) page registry and pinned frames
//! - WAL records carrying compressed before/after page deltas
//! - variable-length keys with overflow chains and an on-disk free list
//! - vacuum that relocates live pages and shrinks the file

pub mod btree;
pub mod env;
pub mod error;
pub mod lock;
pub mod storage;
pub mod wal;

use std::path::Path;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::btree::cursor::CursorPos;
use crate::btree::node::max_key_len;
use crate::btree::ops::Tree;
use crate::env::{DiskEnv, Env, FileEditor, FileReader, SharedEnv};
use crate::lock::FileLock;
use crate::storage::header::{FileHeader, HEADER_SIZE};
use crate::storage::page::{is_valid_page_size, PageId, DEFAULT_PAGE_SIZE};
use crate::storage::pager::Pager;
use crate::wal::recovery;
use crate::wal::writer::WalWriter;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::wal::writer::SyncMode;

/// Tuning knobs fixed at open time.
#[derive(Clone)]
pub struct Options {
    /// Power of two in [512, 32768]; recorded in the file header at
    /// creation and read back on open.
    pub page_size: usize,
    /// Frame pool budget in bytes; frame count = cache_size / page_size.
    pub cache_size: usize,
    pub wal_segment_size: usize,
    pub sync_mode: SyncMode,
    /// Storage backend; the real filesystem when unset.
    pub env: Option<SharedEnv>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: 1 << 20,
            wal_segment_size: wal::DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::Normal,
            env: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub page_count: u64,
    pub record_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tree_height: usize,
}

struct Inner {
    env: SharedEnv,
    path: String,
    pager: Pager,
    tree: Tree,
    record_count: u64,
    mutated: bool,
    shrunk: bool,
    poisoned: Option<(ErrorKind, String)>,
}

/// Main database handle. Mutations are serialized by an internal lock;
/// reads and cursors go through the same lock, one call at a time.
pub struct Database {
    inner: Mutex<Inner>,
    _lock: Option<FileLock>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Segment files live next to the database, named so that neither path is
/// a prefix of the other (fault injection targets them independently).
fn wal_prefix(path: &str) -> String {
    match path.rfind('/') {
        Some(index) => format!("{}/wal-{}-", &path[..index], &path[index + 1..]),
        None => format!("wal-{path}-"),
    }
}

impl Database {
    /// Create or open a database. When WAL segments exist from an earlier
    /// run, recovery replays them before the handle is returned.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Database> {
        if !is_valid_page_size(options.page_size) {
            return Err(Error::InvalidArgument(format!(
                "page size {} is not a power of two in [512, 32768]",
                options.page_size
            )));
        }
        let path = path.as_ref();
        let (env, file_lock): (SharedEnv, Option<FileLock>) = match &options.env {
            Some(env) => (env.clone(), None),
            None => (Arc::new(DiskEnv::new()), Some(FileLock::acquire(path)?)),
        };
        let path = path.to_string_lossy().to_string();
        let prefix = wal_prefix(&path);

        let header = if env.file_exists(&path) {
            recovery::recover(&env, &path, &prefix)?;
            let mut reader = env.open_reader(&path)?;
            let mut buf = [0u8; HEADER_SIZE];
            reader.read_exact_at(0, &mut buf)?;
            FileHeader::decode(&buf)?
        } else {
            let header = FileHeader::new(options.page_size);
            let mut page = vec![0u8; options.page_size];
            header.encode(&mut page);
            let mut file = env.open_editor(&path)?;
            file.write_at(0, &page)?;
            if options.sync_mode != SyncMode::None {
                file.sync()?;
            }
            info!("created {path} with page size {}", options.page_size);
            header
        };

        let frame_count = options.cache_size / header.page_size;
        let wal = WalWriter::open(
            env.clone(),
            prefix,
            options.wal_segment_size,
            header.last_commit_lsn + 1,
            options.sync_mode,
        );
        let pager = Pager::open(&env, &path, wal, &header, frame_count, options.sync_mode)?;
        let tree = Tree::open(header.tree_root);
        Ok(Database {
            inner: Mutex::new(Inner {
                env,
                path,
                pager,
                tree,
                record_count: header.record_count,
                mutated: false,
                shrunk: false,
                poisoned: None,
            }),
            _lock: file_lock,
        })
    }

    /// Insert or replace a record.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if key.is_empty() {
            return Err(Error::InvalidArgument("keys must not be empty".into()));
        }
        let limit = max_key_len(inner.pager.page_size());
        if key.len() > limit {
            return Err(Error::InvalidArgument(format!(
                "key length {} exceeds the maximum {limit}",
                key.len()
            )));
        }
        match inner.put_inner(key, value) {
            Ok(()) => Ok(()),
            Err(err) => Err(inner.abort(err)),
        }
    }

    /// Look up a record.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        inner.check_readable()?;
        if key.is_empty() {
            return Ok(None);
        }
        let inner = &mut *inner;
        inner.tree.get(&mut inner.pager, key)
    }

    /// Remove a record. Returns false (not an error) when the key is
    /// absent.
    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if key.is_empty() {
            return Err(Error::InvalidArgument("keys must not be empty".into()));
        }
        match inner.erase_inner(key) {
            Ok(removed) => Ok(removed),
            Err(err) => Err(inner.abort(err)),
        }
    }

    /// Make everything since the last commit durable, atomically.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if !inner.mutated {
            return Ok(());
        }
        match inner.commit_inner() {
            Ok(()) => Ok(()),
            Err(err) => Err(inner.abort(err)),
        }
    }

    /// Relocate live pages into free-list holes so the next commit can
    /// shrink the file.
    pub fn vacuum(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        match inner.vacuum_inner() {
            Ok(()) => Ok(()),
            Err(err) => Err(inner.abort(err)),
        }
    }

    pub fn stats(&self) -> Result<Stats> {
        let mut inner = self.inner.lock();
        inner.check_readable()?;
        let inner = &mut *inner;
        let tree_height = inner.tree.height(&mut inner.pager)?;
        let cache = inner.pager.cache_stats();
        Ok(Stats {
            page_count: inner.pager.page_count(),
            record_count: inner.record_count,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            tree_height,
        })
    }

    /// An unpositioned cursor. Position it with `seek*` or `next`/`prev`.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            db: self,
            pos: None,
            version: 0,
        }
    }
}

impl Inner {
    fn check_writable(&self) -> Result<()> {
        if let Some((kind, msg)) = &self.poisoned {
            return Err(replay_error(*kind, msg));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        // Reads keep working after a transient error; corruption is sticky
        // for everything.
        match &self.poisoned {
            Some((ErrorKind::Corruption, msg)) => Err(Error::Corruption(msg.clone())),
            _ => Ok(()),
        }
    }

    fn put_inner(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.ensure_root(&mut self.pager)?;
        let added = self.tree.insert(&mut self.pager, key, value)?;
        if added {
            self.record_count += 1;
        }
        self.mutated = true;
        Ok(())
    }

    fn erase_inner(&mut self, key: &[u8]) -> Result<bool> {
        let removed = self.tree.erase(&mut self.pager, key)?;
        if removed {
            self.record_count -= 1;
            self.mutated = true;
        }
        Ok(removed)
    }

    fn commit_inner(&mut self) -> Result<()> {
        // Serialize the data pages' deltas first so the commit LSN is known
        // before the header page is rewritten: one record for the header,
        // then the commit marker.
        self.pager.emit_records()?;
        let commit_lsn = self.pager.wal_next_lsn() + 1;

        let header = FileHeader {
            page_size: self.pager.page_size(),
            page_count: self.pager.page_count(),
            freelist_head: self.pager.freelist_head(),
            record_count: self.record_count,
            last_commit_lsn: commit_lsn,
            tree_root: self.tree.root(),
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        let mut page = self.pager.acquire(PageId::ROOT)?;
        self.pager.upgrade(&mut page);
        let write = self.pager.write(&page, 0, &buf);
        let released = self.pager.release(page);
        write.and(released)?;
        self.pager.emit_records()?;

        // Data pages reach the file only behind the WAL fence; the header
        // page waits until the commit record is durable.
        self.pager.write_back(true)?;
        self.pager.sync()?;
        let assigned = self.pager.wal_commit()?;
        if assigned != commit_lsn {
            return Err(Error::Logic(format!(
                "commit LSN drifted: header says {commit_lsn}, log assigned {assigned}"
            )));
        }
        self.pager.write_back_header()?;
        self.pager.sync()?;
        self.pager.wal_cleanup(commit_lsn)?;
        self.mutated = false;

        if self.shrunk {
            self.shrunk = false;
            let expected = self.pager.page_count() * self.pager.page_size() as u64;
            if self.env.file_size(&self.path)? > expected {
                self.env.resize_file(&self.path, expected)?;
            }
        }
        Ok(())
    }

    fn vacuum_inner(&mut self) -> Result<()> {
        if self.tree.vacuum(&mut self.pager)? {
            self.mutated = true;
            self.shrunk = true;
        }
        Ok(())
    }

    /// Discard the failed transaction and rewind to the last committed
    /// state. System errors leave the handle read-only; corruption poisons
    /// it entirely.
    fn abort(&mut self, err: Error) -> Error {
        let version = self.tree.version() + 1;
        if let Ok(header) = self.read_committed_header() {
            self.pager.discard_all(&header);
            self.tree = Tree::with_version(header.tree_root, version);
            self.record_count = header.record_count;
        } else {
            self.tree = Tree::with_version(self.tree.root(), version);
        }
        self.mutated = false;
        self.shrunk = false;
        if !matches!(err.kind(), ErrorKind::NotFound | ErrorKind::InvalidArgument) {
            self.poisoned = Some((err.kind(), err.to_string()));
        }
        err
    }

    fn read_committed_header(&self) -> Result<FileHeader> {
        let mut reader = self.env.open_reader(&self.path)?;
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact_at(0, &mut buf)?;
        FileHeader::decode(&buf)
    }
}

fn replay_error(kind: ErrorKind, msg: &str) -> Error {
    let msg = format!("rejected after an earlier failure: {msg}");
    match kind {
        ErrorKind::Corruption => Error::Corruption(msg),
        ErrorKind::Busy => Error::Busy(msg),
        ErrorKind::LogicError => Error::Logic(msg),
        ErrorKind::NotSupported => Error::NotSupported(msg),
        _ => Error::System(msg),
    }
}

/// Ordered iteration over committed and uncommitted records of this
/// handle. A structural change to the tree invalidates the position; the
/// next use reports not-found, and `seek*` re-validates.
pub struct Cursor<'a> {
    db: &'a Database,
    pos: Option<CursorPos>,
    version: u64,
}

type Entry = (Vec<u8>, Vec<u8>);

impl Cursor<'_> {
    fn position(
        &mut self,
        find: impl FnOnce(&Tree, &mut Pager) -> Result<Option<CursorPos>>,
    ) -> Result<Option<Entry>> {
        let mut inner = self.db.inner.lock();
        inner.check_readable()?;
        let inner = &mut *inner;
        let pos = find(&inner.tree, &mut inner.pager)?;
        self.version = inner.tree.version();
        self.pos = pos;
        match pos {
            Some(p) => inner.tree.entry_at(&mut inner.pager, p).map(Some),
            None => Ok(None),
        }
    }

    pub fn seek_first(&mut self) -> Result<Option<Entry>> {
        self.position(|tree, pager| tree.first_pos(pager))
    }

    pub fn seek_last(&mut self) -> Result<Option<Entry>> {
        self.position(|tree, pager| tree.last_pos(pager))
    }

    /// Position at the first record with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        self.position(|tree, pager| tree.seek_pos(pager, key))
    }

    fn step(
        &mut self,
        advance: impl FnOnce(&Tree, &mut Pager, CursorPos) -> Result<Option<CursorPos>>,
        restart: impl FnOnce(&Tree, &mut Pager) -> Result<Option<CursorPos>>,
    ) -> Result<Option<Entry>> {
        let Some(pos) = self.pos else {
            return self.position(restart);
        };
        let mut inner = self.db.inner.lock();
        inner.check_readable()?;
        let inner = &mut *inner;
        if self.version != inner.tree.version() {
            self.pos = None;
            return Err(Error::NotFound(
                "cursor invalidated by a structural change".into(),
            ));
        }
        let next = advance(&inner.tree, &mut inner.pager, pos)?;
        self.pos = next;
        match next {
            Some(p) => inner.tree.entry_at(&mut inner.pager, p).map(Some),
            None => Ok(None),
        }
    }

    /// Advance and return the new current entry. On an unpositioned cursor
    /// this behaves like `seek_first`.
    pub fn next(&mut self) -> Result<Option<Entry>> {
        self.step(
            |tree, pager, pos| tree.next_pos(pager, pos),
            |tree, pager| tree.first_pos(pager),
        )
    }

    /// Step backwards; `seek_last` when unpositioned.
    pub fn prev(&mut self) -> Result<Option<Entry>> {
        self.step(
            |tree, pager, pos| tree.prev_pos(pager, pos),
            |tree, pager| tree.last_pos(pager),
        )
    }
}
