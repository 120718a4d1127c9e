/// Open-time recovery: replay the WAL against the data file.
///
/// Committed records (LSN at or below the newest durable commit) are redone
/// by applying their after-images. Records past the last commit are torn or
/// uncommitted work; their before-images are applied in reverse LSN order so
/// that pages flushed mid-transaction are rolled back. Afterwards the header
/// is stamped, the data file is synced, and every segment is removed.
use log::info;

use crate::env::{Env, FileEditor, FileReader, SharedEnv};
use crate::error::{Error, Result};
use crate::storage::header::{FileHeader, HEADER_SIZE};
use crate::storage::page::{put_u64, Lsn, PageId, PAGE_LSN_OFFSET};
use crate::wal::reader::WalReader;
use crate::wal::record::{DeltaEntry, Payload};

#[derive(Debug, Clone, Copy)]
pub struct RecoverySummary {
    pub records_redone: usize,
    pub records_undone: usize,
    pub last_commit_lsn: Lsn,
}

enum Apply {
    After,
    Before,
}

fn apply_record(
    file: &mut dyn FileEditor,
    page_size: usize,
    pid: PageId,
    entries: &[DeltaEntry],
    which: Apply,
    stamp_lsn: Lsn,
) -> Result<()> {
    if pid.is_null() {
        return Err(Error::Corruption("WAL record references the null page".into()));
    }
    let mut buf = vec![0u8; page_size];
    let offset = pid.file_offset(page_size);
    // Zero-extend: the page may not have reached the data file yet.
    let _ = file.read_at(offset, &mut buf)?;
    for entry in entries {
        let start = entry.offset as usize;
        let bytes = match which {
            Apply::After => &entry.after,
            Apply::Before => &entry.before,
        };
        if start + bytes.len() > page_size {
            return Err(Error::Corruption(format!(
                "WAL delta for page {pid} exceeds the page size"
            )));
        }
        buf[start..start + bytes.len()].copy_from_slice(bytes);
    }
    if !pid.is_root() {
        put_u64(&mut buf, PAGE_LSN_OFFSET, stamp_lsn);
    }
    file.write_at(offset, &buf)?;
    Ok(())
}

/// Run recovery if WAL segments exist. Returns `None` when there is nothing
/// to replay.
pub fn recover(env: &SharedEnv, db_path: &str, wal_prefix: &str) -> Result<Option<RecoverySummary>> {
    let mut reader = WalReader::open(env.clone(), wal_prefix)?;
    if reader.is_empty() {
        return Ok(None);
    }
    let records = reader.read_all()?;

    let mut file = env.open_editor(db_path)?;
    let mut header_buf = [0u8; HEADER_SIZE];
    file.read_exact_at(0, &mut header_buf)?;
    let header = FileHeader::decode(&header_buf)?;
    let page_size = header.page_size;

    let last_commit = WalReader::last_commit_lsn(&records).unwrap_or(header.last_commit_lsn);

    let mut records_redone = 0;
    let mut records_undone = 0;
    for record in &records {
        if record.lsn > last_commit {
            break;
        }
        if let Payload::PageDeltas { pid, entries } = &record.payload {
            apply_record(file.as_mut(), page_size, *pid, entries, Apply::After, record.lsn)?;
            records_redone += 1;
        }
    }
    for record in records.iter().rev() {
        if record.lsn <= last_commit {
            break;
        }
        if let Payload::PageDeltas { pid, entries } = &record.payload {
            apply_record(file.as_mut(), page_size, *pid, entries, Apply::Before, last_commit)?;
            records_undone += 1;
        }
    }

    // The header page may itself have been replayed; re-read it, stamp the
    // recovered commit LSN, and make everything durable before the segments
    // go away.
    file.read_exact_at(0, &mut header_buf)?;
    let mut header = FileHeader::decode(&header_buf)?;
    header.last_commit_lsn = last_commit;
    header.encode(&mut header_buf);
    file.write_at(0, &header_buf)?;
    file.sync()?;
    drop(file);

    // Undone allocations can leave garbage pages past the recovered count.
    let expected = header.page_count * page_size as u64;
    if env.file_size(db_path)? > expected {
        env.resize_file(db_path, expected)?;
    }

    reader.remove_all()?;
    info!(
        "recovered {db_path}: {records_redone} records redone, {records_undone} undone, \
         last commit LSN {last_commit}"
    );
    Ok(Some(RecoverySummary {
        records_redone,
        records_undone,
        last_commit_lsn: last_commit,
    }))
}
