/// Segmented append-only WAL writer.
///
/// Records are appended to the active segment; a record that does not fit in
/// the remaining capacity is fragmented across a segment boundary. Sealed
/// segments are synced before the writer moves on, so `flush_to` only ever
/// needs to sync the active segment.
use log::debug;

use crate::env::{AppendLog, Env, SharedEnv};
use crate::error::{Error, Result};
use crate::storage::page::{Lsn, PageId};
use crate::wal::record::{encode_deltas, encode_frame, DeltaEntry, RecordType};
use crate::wal::{segment_file_name, MAX_FRAGMENT_SIZE, RECORD_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    None,
    Normal,
    Full,
}

struct SealedSegment {
    name: String,
    last_lsn: Lsn,
}

pub struct WalWriter {
    env: SharedEnv,
    prefix: String,
    segment_size: usize,
    sync_mode: SyncMode,

    segment: Option<Box<dyn AppendLog>>,
    segment_name: String,
    segment_bytes: usize,
    // Strictly increasing name counter; a fragmented record can span
    // several segments that would otherwise collide on its LSN.
    next_segment_name: Lsn,

    next_lsn: Lsn,
    last_lsn: Lsn,
    flushed_lsn: Lsn,
    sealed: Vec<SealedSegment>,
}

impl WalWriter {
    /// `next_lsn` is the LSN the first appended record will receive, i.e.
    /// one past the last committed LSN after recovery.
    pub fn open(
        env: SharedEnv,
        prefix: impl Into<String>,
        segment_size: usize,
        next_lsn: Lsn,
        sync_mode: SyncMode,
    ) -> WalWriter {
        WalWriter {
            env,
            prefix: prefix.into(),
            segment_size,
            sync_mode,
            segment: None,
            segment_name: String::new(),
            segment_bytes: 0,
            next_segment_name: next_lsn,
            next_lsn,
            last_lsn: next_lsn.saturating_sub(1),
            flushed_lsn: next_lsn.saturating_sub(1),
            sealed: Vec::new(),
        }
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    fn ensure_segment(&mut self) -> Result<()> {
        if self.segment.is_none() {
            let name_lsn = self.next_lsn.max(self.next_segment_name);
            let name = segment_file_name(&self.prefix, name_lsn);
            self.segment = Some(self.env.open_logger(&name)?);
            self.segment_name = name;
            self.segment_bytes = 0;
            self.next_segment_name = name_lsn + 1;
        }
        Ok(())
    }

    fn roll_segment(&mut self, last_lsn: Lsn) -> Result<()> {
        if let Some(mut segment) = self.segment.take() {
            if self.sync_mode != SyncMode::None {
                segment.sync()?;
            }
            debug!(
                "sealed WAL segment {} ({} bytes, through LSN {})",
                self.segment_name, self.segment_bytes, last_lsn
            );
            self.sealed.push(SealedSegment {
                name: std::mem::take(&mut self.segment_name),
                last_lsn,
            });
            self.segment_bytes = 0;
        }
        Ok(())
    }

    /// Append one logical record, fragmenting across segments as needed.
    fn append_record(&mut self, kind: RecordType, payload: &[u8]) -> Result<Lsn> {
        let lsn = self.next_lsn;
        let mut remaining = payload;
        let mut first = true;
        loop {
            self.ensure_segment()?;
            let mut room = self.segment_size.saturating_sub(self.segment_bytes);
            if room < RECORD_HEADER_SIZE + remaining.len().min(1) {
                // Not enough space for any useful fragment here.
                self.roll_segment(lsn.saturating_sub(1))?;
                self.ensure_segment()?;
                room = self.segment_size;
            }
            let chunk_len = remaining
                .len()
                .min(room - RECORD_HEADER_SIZE)
                .min(MAX_FRAGMENT_SIZE);
            let done = chunk_len == remaining.len();
            let fragment_kind = match (kind, first, done) {
                (RecordType::Commit, _, _) => RecordType::Commit,
                (_, true, true) => RecordType::Full,
                (_, true, false) => RecordType::First,
                (_, false, false) => RecordType::Middle,
                (_, false, true) => RecordType::Last,
            };
            let frame = encode_frame(lsn, fragment_kind, &remaining[..chunk_len]);
            self.segment
                .as_mut()
                .expect("segment is open")
                .append(&frame)?;
            self.segment_bytes += frame.len();
            remaining = &remaining[chunk_len..];
            first = false;
            if done {
                break;
            }
        }
        self.next_lsn += 1;
        self.last_lsn = lsn;
        if self.segment_bytes >= self.segment_size {
            self.roll_segment(lsn)?;
        }
        Ok(lsn)
    }

    /// Log one page's delta set. The record is buffered, not yet durable.
    pub fn log_deltas(&mut self, pid: PageId, entries: &[DeltaEntry]) -> Result<Lsn> {
        if entries.is_empty() {
            return Err(Error::Logic("empty delta set logged to WAL".into()));
        }
        let payload = encode_deltas(pid, entries);
        self.append_record(RecordType::Full, &payload)
    }

    /// Make every record with LSN <= `lsn` durable.
    pub fn flush_to(&mut self, lsn: Lsn) -> Result<()> {
        if lsn <= self.flushed_lsn {
            return Ok(());
        }
        if self.sync_mode != SyncMode::None {
            if let Some(segment) = self.segment.as_mut() {
                segment.sync()?;
            }
        }
        self.flushed_lsn = self.last_lsn;
        Ok(())
    }

    /// Append a commit record and flush the log through it.
    pub fn commit(&mut self) -> Result<Lsn> {
        let lsn = self.append_record(RecordType::Commit, &[])?;
        self.flush_to(lsn)?;
        Ok(lsn)
    }

    /// Remove sealed segments whose records all have LSN < `up_to`.
    pub fn cleanup(&mut self, up_to: Lsn) -> Result<()> {
        let mut kept = Vec::new();
        for sealed in self.sealed.drain(..) {
            if sealed.last_lsn < up_to {
                debug!("removing obsolete WAL segment {}", sealed.name);
                self.env.remove_file(&sealed.name)?;
            } else {
                kept.push(sealed);
            }
        }
        self.sealed = kept;
        Ok(())
    }
}
