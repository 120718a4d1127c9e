/// Abstract storage environment.
///
/// Everything the storage core knows about the outside world goes through
/// these traits: positioned file I/O, append-only logs, and directory
/// operations. Two backends exist: `DiskEnv` (real filesystem) and `MemEnv`
/// (in-memory, with interceptable syscalls for fault injection).
use std::sync::Arc;

use crate::error::Result;

pub mod disk;
pub mod mem;

pub use disk::DiskEnv;
pub use mem::{Interceptor, MemEnv, OpKind};

/// Random-access reads.
pub trait FileReader: Send {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; short reads happen only at end-of-file.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n != buf.len() {
            return Err(crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read: wanted {} bytes, got {}", buf.len(), n),
            )));
        }
        Ok(())
    }
}

/// Random-access reads and writes plus durability.
pub trait FileEditor: FileReader {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// Append-only log file (WAL segments).
pub trait AppendLog: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// The capability set the core consumes. Implementations are chosen at
/// `Database::open` time and shared by the pager and the WAL.
pub trait Env: Send + Sync {
    fn open_reader(&self, path: &str) -> Result<Box<dyn FileReader>>;
    fn open_editor(&self, path: &str) -> Result<Box<dyn FileEditor>>;
    fn open_logger(&self, path: &str) -> Result<Box<dyn AppendLog>>;

    fn remove_file(&self, path: &str) -> Result<()>;
    fn rename_file(&self, from: &str, to: &str) -> Result<()>;
    fn resize_file(&self, path: &str, size: u64) -> Result<()>;
    fn file_exists(&self, path: &str) -> bool;
    fn file_size(&self, path: &str) -> Result<u64>;
    fn list_children(&self, dir: &str) -> Result<Vec<String>>;
    fn create_dir(&self, dir: &str) -> Result<()>;
    fn remove_dir(&self, dir: &str) -> Result<()>;
}

pub type SharedEnv = Arc<dyn Env>;
