/// Process-level exclusion for databases on a real filesystem.
///
/// A sidecar lock file carries an advisory lock for the lifetime of the
/// handle. Intra-process serialization is a mutex inside `Database`; this
/// guards against a second process opening the same file.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct FileLock {
    lock_file: File,
    #[allow(dead_code)]
    lock_path: PathBuf,
}

impl FileLock {
    pub fn acquire(db_path: &Path) -> Result<FileLock> {
        let lock_path = db_path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                Error::Busy(format!(
                    "database is locked by another process: {}",
                    lock_path.display()
                ))
            } else {
                Error::System(format!("failed to acquire database lock: {e}"))
            }
        })?;
        Ok(FileLock { lock_file, lock_path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_lock_on_same_path_is_busy() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        std::fs::File::create(&db_path).unwrap();

        let held = FileLock::acquire(&db_path).unwrap();
        let err = FileLock::acquire(&db_path).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));

        drop(held);
        let _relock = FileLock::acquire(&db_path).unwrap();
    }
}
