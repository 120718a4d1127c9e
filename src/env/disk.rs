/// Filesystem-backed environment.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::env::{AppendLog, Env, FileEditor, FileReader};
use crate::error::Result;

#[derive(Default)]
pub struct DiskEnv;

impl DiskEnv {
    pub fn new() -> Self {
        DiskEnv
    }
}

struct DiskFile {
    file: File,
}

impl FileReader for DiskFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }
}

impl FileEditor for DiskFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

struct DiskLog {
    file: File,
}

impl AppendLog for DiskLog {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Env for DiskEnv {
    fn open_reader(&self, path: &str) -> Result<Box<dyn FileReader>> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Box::new(DiskFile { file }))
    }

    fn open_editor(&self, path: &str) -> Result<Box<dyn FileEditor>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Box::new(DiskFile { file }))
    }

    fn open_logger(&self, path: &str) -> Result<Box<dyn AppendLog>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(DiskLog { file }))
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn resize_file(&self, path: &str, size: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(size)?;
        file.sync_all()?;
        Ok(())
    }

    fn file_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn list_children(&self, dir: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn create_dir(&self, dir: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn remove_dir(&self, dir: &str) -> Result<()> {
        std::fs::remove_dir(dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_write_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f").to_string_lossy().to_string();
        let env = DiskEnv::new();

        let mut editor = env.open_editor(&path).unwrap();
        editor.write_at(0, b"hello").unwrap();
        editor.write_at(5, b" world").unwrap();
        editor.sync().unwrap();

        let mut buf = [0u8; 11];
        let mut reader = env.open_reader(&path).unwrap();
        reader.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
        assert_eq!(env.file_size(&path).unwrap(), 11);
    }

    #[test]
    fn append_log_grows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log").to_string_lossy().to_string();
        let env = DiskEnv::new();

        let mut log = env.open_logger(&path).unwrap();
        log.append(b"abc").unwrap();
        log.append(b"def").unwrap();
        log.sync().unwrap();
        assert_eq!(env.file_size(&path).unwrap(), 6);
    }

    #[test]
    fn resize_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f").to_string_lossy().to_string();
        let env = DiskEnv::new();

        let mut editor = env.open_editor(&path).unwrap();
        editor.write_at(0, &[0xAA; 100]).unwrap();
        drop(editor);
        env.resize_file(&path, 40).unwrap();
        assert_eq!(env.file_size(&path).unwrap(), 40);
    }
}
