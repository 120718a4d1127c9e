/// In-memory environment with controllable failures.
///
/// File contents live in a shared map. Before each matching syscall the
/// registered interceptors are consulted: a non-ok status aborts the call.
/// This is the sole fault-injection surface; every test that proves crash
/// safety drives failures through here.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::env::{AppendLog, Env, FileEditor, FileReader};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Open,
    Sync,
    Unlink,
    Resize,
}

type Thunk = Arc<dyn Fn() -> Result<()> + Send + Sync>;

pub struct Interceptor {
    prefix: String,
    kind: OpKind,
    thunk: Thunk,
}

impl Interceptor {
    pub fn new<F>(prefix: impl Into<String>, kind: OpKind, thunk: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Interceptor {
            prefix: prefix.into(),
            kind,
            thunk: Arc::new(thunk),
        }
    }
}

#[derive(Default, Clone)]
struct FileState {
    buffer: Vec<u8>,
    // Image as of the last successful sync, for crash simulation.
    synced: Vec<u8>,
}

#[derive(Default)]
struct Shared {
    files: HashMap<String, FileState>,
    interceptors: Vec<Interceptor>,
}

impl Shared {
    fn intercept(&self, kind: OpKind, path: &str) -> Result<()> {
        for i in &self.interceptors {
            if i.kind == kind && path.starts_with(&i.prefix) {
                (i.thunk)()?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemEnv {
    shared: Arc<Mutex<Shared>>,
}

impl MemEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interceptor(&self, interceptor: Interceptor) {
        self.shared.lock().interceptors.push(interceptor);
    }

    pub fn clear_interceptors(&self) {
        self.shared.lock().interceptors.clear();
    }

    /// Roll every file back to its state at the last successful sync,
    /// simulating a crash that loses OS-buffered writes.
    pub fn drop_after_last_sync(&self) {
        let mut shared = self.shared.lock();
        for state in shared.files.values_mut() {
            state.buffer = state.synced.clone();
        }
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.lock().files.get(path).map(|s| s.buffer.clone())
    }

    pub fn put_file_contents(&self, path: &str, contents: Vec<u8>) {
        let mut shared = self.shared.lock();
        let state = shared.files.entry(path.to_string()).or_default();
        state.synced = contents.clone();
        state.buffer = contents;
    }
}

struct MemFile {
    shared: Arc<Mutex<Shared>>,
    path: String,
}

impl FileReader for MemFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let shared = self.shared.lock();
        shared.intercept(OpKind::Read, &self.path)?;
        let state = shared
            .files
            .get(&self.path)
            .ok_or_else(|| Error::NotFound(format!("no such file: {}", self.path)))?;
        let offset = offset as usize;
        if offset >= state.buffer.len() {
            return Ok(0);
        }
        let n = buf.len().min(state.buffer.len() - offset);
        buf[..n].copy_from_slice(&state.buffer[offset..offset + n]);
        Ok(n)
    }
}

impl FileEditor for MemFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.intercept(OpKind::Write, &self.path)?;
        let state = shared.files.entry(self.path.clone()).or_default();
        let end = offset as usize + data.len();
        if state.buffer.len() < end {
            state.buffer.resize(end, 0);
        }
        state.buffer[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.intercept(OpKind::Sync, &self.path)?;
        if let Some(state) = shared.files.get_mut(&self.path) {
            state.synced = state.buffer.clone();
        }
        Ok(())
    }
}

impl AppendLog for MemFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.intercept(OpKind::Write, &self.path)?;
        let state = shared.files.entry(self.path.clone()).or_default();
        state.buffer.extend_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        FileEditor::sync(self)
    }
}

impl Env for MemEnv {
    fn open_reader(&self, path: &str) -> Result<Box<dyn FileReader>> {
        let shared = self.shared.lock();
        shared.intercept(OpKind::Open, path)?;
        if !shared.files.contains_key(path) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {path}"),
            )));
        }
        drop(shared);
        Ok(Box::new(MemFile {
            shared: self.shared.clone(),
            path: path.to_string(),
        }))
    }

    fn open_editor(&self, path: &str) -> Result<Box<dyn FileEditor>> {
        let mut shared = self.shared.lock();
        shared.intercept(OpKind::Open, path)?;
        shared.files.entry(path.to_string()).or_default();
        drop(shared);
        Ok(Box::new(MemFile {
            shared: self.shared.clone(),
            path: path.to_string(),
        }))
    }

    fn open_logger(&self, path: &str) -> Result<Box<dyn AppendLog>> {
        let mut shared = self.shared.lock();
        shared.intercept(OpKind::Open, path)?;
        shared.files.entry(path.to_string()).or_default();
        drop(shared);
        Ok(Box::new(MemFile {
            shared: self.shared.clone(),
            path: path.to_string(),
        }))
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.intercept(OpKind::Unlink, path)?;
        shared
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no such file: {path}")))
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.intercept(OpKind::Open, from)?;
        let state = shared
            .files
            .remove(from)
            .ok_or_else(|| Error::NotFound(format!("no such file: {from}")))?;
        shared.files.insert(to.to_string(), state);
        Ok(())
    }

    fn resize_file(&self, path: &str, size: u64) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.intercept(OpKind::Resize, path)?;
        let state = shared
            .files
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(format!("no such file: {path}")))?;
        state.buffer.resize(size as usize, 0);
        state.synced = state.buffer.clone();
        Ok(())
    }

    fn file_exists(&self, path: &str) -> bool {
        self.shared.lock().files.contains_key(path)
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        let shared = self.shared.lock();
        shared
            .files
            .get(path)
            .map(|s| s.buffer.len() as u64)
            .ok_or_else(|| Error::NotFound(format!("no such file: {path}")))
    }

    fn create_dir(&self, _dir: &str) -> Result<()> {
        // Directories are implicit in the flat path map.
        Ok(())
    }

    fn remove_dir(&self, dir: &str) -> Result<()> {
        if self.list_children(dir)?.is_empty() {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::other(format!(
                "directory not empty: {dir}"
            ))))
        }
    }

    fn list_children(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{dir}/")
        };
        let shared = self.shared.lock();
        let mut names: Vec<String> = shared
            .files
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn write_then_read() {
        let env = MemEnv::new();
        let mut editor = env.open_editor("/db/data").unwrap();
        editor.write_at(0, b"abcdef").unwrap();
        editor.write_at(3, b"XYZ").unwrap();

        let mut buf = [0u8; 6];
        let mut reader = env.open_reader("/db/data").unwrap();
        reader.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcXYZ");
    }

    #[test]
    fn interceptor_aborts_matching_syscall() {
        let env = MemEnv::new();
        env.open_editor("/db/data").unwrap();
        env.add_interceptor(Interceptor::new("/db/data", OpKind::Write, || {
            Err(Error::Io(std::io::Error::other("injected")))
        }));

        let mut editor = env.open_editor("/db/data").unwrap();
        assert!(editor.write_at(0, b"x").is_err());

        // Other paths and other ops are unaffected.
        let mut other = env.open_editor("/db/wal-0001").unwrap();
        other.write_at(0, b"ok").unwrap();

        env.clear_interceptors();
        editor.write_at(0, b"x").unwrap();
    }

    #[test]
    fn interceptor_can_toggle() {
        let env = MemEnv::new();
        let armed = Arc::new(AtomicBool::new(false));
        let armed2 = armed.clone();
        env.add_interceptor(Interceptor::new("/db", OpKind::Sync, move || {
            if armed2.load(Ordering::SeqCst) {
                Err(Error::Io(std::io::Error::other("injected sync failure")))
            } else {
                Ok(())
            }
        }));

        let mut editor = env.open_editor("/db/data").unwrap();
        editor.sync().unwrap();
        armed.store(true, Ordering::SeqCst);
        assert!(editor.sync().is_err());
    }

    #[test]
    fn drop_after_last_sync_loses_unsynced_writes() {
        let env = MemEnv::new();
        let mut editor = env.open_editor("/db/data").unwrap();
        editor.write_at(0, b"durable").unwrap();
        editor.sync().unwrap();
        editor.write_at(0, b"ephemer").unwrap();

        env.drop_after_last_sync();
        assert_eq!(env.file_contents("/db/data").unwrap(), b"durable");
    }

    #[test]
    fn list_children_filters_by_directory() {
        let env = MemEnv::new();
        env.open_editor("/db/data").unwrap();
        env.open_editor("/db/wal-0001").unwrap();
        env.open_editor("/other/file").unwrap();

        let names = env.list_children("/db").unwrap();
        assert_eq!(names, vec!["data".to_string(), "wal-0001".to_string()]);
    }
}
