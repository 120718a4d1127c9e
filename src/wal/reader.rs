/// WAL reader: iterates sealed and active segments in LSN order and
/// reassembles fragmented records.
///
/// Torn frames at the tail of the log are tolerated (a crash can truncate
/// the last append); a bad frame with valid frames after it is mid-log
/// corruption and is reported as a hard error, so committed records are
/// never silently dropped.
use crate::env::{Env, FileReader, SharedEnv};
use crate::error::{Error, Result};
use crate::storage::page::Lsn;
use crate::wal::record::{decode_deltas, decode_frame, LogicalRecord, Payload, RecordType};
use crate::wal::{parse_segment_name, split_prefix};

pub struct WalReader {
    env: SharedEnv,
    /// Segment file paths ordered by first LSN.
    segments: Vec<(Lsn, String)>,
}

struct Pending {
    lsn: Lsn,
    buf: Vec<u8>,
}

impl WalReader {
    pub fn open(env: SharedEnv, prefix: &str) -> Result<WalReader> {
        let (dir, name_prefix) = split_prefix(prefix);
        let mut segments = Vec::new();
        for name in env.list_children(&dir).unwrap_or_default() {
            if let Some(first_lsn) = parse_segment_name(&name_prefix, &name) {
                segments.push((first_lsn, format!("{dir}/{name}")));
            }
        }
        segments.sort();
        Ok(WalReader { env, segments })
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment_paths(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|(_, path)| path.as_str())
    }

    fn read_segment(&self, path: &str) -> Result<Vec<u8>> {
        let size = self.env.file_size(path)?;
        let mut buf = vec![0u8; size as usize];
        let mut reader = self.env.open_reader(path)?;
        reader.read_exact_at(0, &mut buf)?;
        Ok(buf)
    }

    /// True if any CRC-valid frame begins at one of the frame boundaries in
    /// `buf[pos..]` or in any later segment. Distinguishes a torn tail from
    /// mid-log corruption.
    fn valid_frame_ahead(&self, buf: &[u8], mut pos: usize, later_segments: &[(Lsn, String)]) -> bool {
        while pos < buf.len() {
            // Probe every byte offset; the claimed frame length is
            // unreliable once a frame fails its CRC.
            if matches!(decode_frame(&buf[pos..]), Ok(Some(_))) {
                return true;
            }
            pos += 1;
        }
        for (_, path) in later_segments {
            if let Ok(data) = self.read_segment(path) {
                if matches!(decode_frame(&data), Ok(Some(_))) {
                    return true;
                }
            }
        }
        false
    }

    /// Read every logical record in LSN order, stopping cleanly at a torn
    /// tail.
    pub fn read_all(&mut self) -> Result<Vec<LogicalRecord>> {
        let mut records = Vec::new();
        let mut pending: Option<Pending> = None;

        let segments = self.segments.clone();
        for (index, (_, path)) in segments.iter().enumerate() {
            let data = self.read_segment(path)?;
            let mut pos = 0;
            let mut at_segment_start = true;
            while pos < data.len() {
                let frame = match decode_frame(&data[pos..]) {
                    Ok(Some(frame)) => frame,
                    // Torn tail inside this segment; nothing after it can be
                    // trusted.
                    Ok(None) => return Ok(records),
                    Err(err) => {
                        if self.valid_frame_ahead(&data, pos + 1, &segments[index + 1..]) {
                            return Err(err);
                        }
                        return Ok(records);
                    }
                };
                let frame_size = frame.size;
                match frame.kind {
                    RecordType::Full | RecordType::Commit => {
                        if pending.is_some() {
                            // A continuation never arrived. At a segment
                            // boundary the partial payload is a torn write;
                            // mid-segment it means the log is inconsistent.
                            if !at_segment_start {
                                return Err(Error::Corruption(format!(
                                    "fragment sequence broken at LSN {}",
                                    frame.lsn
                                )));
                            }
                            pending = None;
                        }
                        let payload = match frame.kind {
                            RecordType::Commit => Payload::Commit,
                            _ => {
                                let (pid, entries) = decode_deltas(frame.payload)?;
                                Payload::PageDeltas { pid, entries }
                            }
                        };
                        records.push(LogicalRecord { lsn: frame.lsn, payload });
                    }
                    RecordType::First => {
                        if pending.is_some() && !at_segment_start {
                            return Err(Error::Corruption(format!(
                                "fragment sequence broken at LSN {}",
                                frame.lsn
                            )));
                        }
                        pending = Some(Pending {
                            lsn: frame.lsn,
                            buf: frame.payload.to_vec(),
                        });
                    }
                    RecordType::Middle | RecordType::Last => {
                        let Some(partial) = pending.as_mut() else {
                            return Err(Error::Corruption(format!(
                                "continuation fragment without a first at LSN {}",
                                frame.lsn
                            )));
                        };
                        if partial.lsn != frame.lsn {
                            return Err(Error::Corruption(format!(
                                "fragment LSN mismatch: expected {}, found {}",
                                partial.lsn, frame.lsn
                            )));
                        }
                        partial.buf.extend_from_slice(frame.payload);
                        if frame.kind == RecordType::Last {
                            let done = pending.take().expect("pending fragment");
                            let (pid, entries) = decode_deltas(&done.buf)?;
                            records.push(LogicalRecord {
                                lsn: done.lsn,
                                payload: Payload::PageDeltas { pid, entries },
                            });
                        }
                    }
                }
                pos += frame_size;
                at_segment_start = false;
            }
        }
        // A pending fragment with no continuation in any segment is a torn
        // write after the last complete record.
        Ok(records)
    }

    /// The highest LSN of any commit record, if one exists.
    pub fn last_commit_lsn(records: &[LogicalRecord]) -> Option<Lsn> {
        records
            .iter()
            .filter(|r| matches!(r.payload, Payload::Commit))
            .map(|r| r.lsn)
            .max()
    }

    /// Remove every segment file. Used once recovery has made the log's
    /// effects durable in the data file.
    pub fn remove_all(&mut self) -> Result<()> {
        for (_, path) in self.segments.drain(..) {
            self.env.remove_file(&path)?;
        }
        Ok(())
    }
}
