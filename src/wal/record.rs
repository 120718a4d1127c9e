/// WAL record codecs.
///
/// Physical frame layout:
///   [lsn: u64] [crc32c: u32] [type: u8] [payload_len: u16] [payload]
///
/// The CRC covers everything after the CRC field (type, length, payload).
/// Logical payloads that do not fit in one frame are fragmented as
/// first / middle* / last; full records and commit markers are standalone.
use crate::error::{Error, Result};
use crate::storage::page::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64, Lsn, PageId};
use crate::wal::RECORD_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
    Commit = 5,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<RecordType> {
        match value {
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            5 => Some(RecordType::Commit),
            _ => None,
        }
    }
}

/// One modified byte range with its images on both sides of the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEntry {
    pub offset: u16,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

/// A reassembled logical record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    PageDeltas { pid: PageId, entries: Vec<DeltaEntry> },
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRecord {
    pub lsn: Lsn,
    pub payload: Payload,
}

/// Encode a data payload: page id, entry count, then per entry the offset,
/// size, before bytes, and after bytes.
pub fn encode_deltas(pid: PageId, entries: &[DeltaEntry]) -> Vec<u8> {
    let total: usize = entries.iter().map(|e| 4 + e.before.len() + e.after.len()).sum();
    let mut buf = vec![0u8; 10 + total];
    put_u64(&mut buf, 0, pid.0);
    put_u16(&mut buf, 8, entries.len() as u16);
    let mut pos = 10;
    for entry in entries {
        debug_assert_eq!(entry.before.len(), entry.after.len());
        put_u16(&mut buf, pos, entry.offset);
        put_u16(&mut buf, pos + 2, entry.before.len() as u16);
        pos += 4;
        buf[pos..pos + entry.before.len()].copy_from_slice(&entry.before);
        pos += entry.before.len();
        buf[pos..pos + entry.after.len()].copy_from_slice(&entry.after);
        pos += entry.after.len();
    }
    buf
}

pub fn decode_deltas(buf: &[u8]) -> Result<(PageId, Vec<DeltaEntry>)> {
    if buf.len() < 10 {
        return Err(Error::Corruption("WAL data payload truncated".into()));
    }
    let pid = PageId(get_u64(buf, 0));
    let count = get_u16(buf, 8) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 10;
    for _ in 0..count {
        if pos + 4 > buf.len() {
            return Err(Error::Corruption("WAL delta entry truncated".into()));
        }
        let offset = get_u16(buf, pos);
        let size = get_u16(buf, pos + 2) as usize;
        pos += 4;
        if pos + 2 * size > buf.len() {
            return Err(Error::Corruption("WAL delta bytes truncated".into()));
        }
        let before = buf[pos..pos + size].to_vec();
        pos += size;
        let after = buf[pos..pos + size].to_vec();
        pos += size;
        entries.push(DeltaEntry { offset, before, after });
    }
    if pos != buf.len() {
        return Err(Error::Corruption("trailing bytes in WAL data payload".into()));
    }
    Ok((pid, entries))
}

/// Frame a payload chunk into a physical record.
pub fn encode_frame(lsn: Lsn, kind: RecordType, chunk: &[u8]) -> Vec<u8> {
    debug_assert!(chunk.len() <= u16::MAX as usize);
    let mut buf = vec![0u8; RECORD_HEADER_SIZE + chunk.len()];
    put_u64(&mut buf, 0, lsn);
    buf[12] = kind as u8;
    put_u16(&mut buf, 13, chunk.len() as u16);
    buf[15..].copy_from_slice(chunk);
    let crc = crc32c::crc32c(&buf[12..]);
    put_u32(&mut buf, 8, crc);
    buf
}

#[derive(Debug)]
pub struct Frame<'a> {
    pub lsn: Lsn,
    pub kind: RecordType,
    pub payload: &'a [u8],
    /// Total bytes consumed from the input.
    pub size: usize,
}

/// Parse and verify one physical frame from the front of `buf`.
///
/// `Ok(None)` means the bytes are a torn tail (truncated header or payload);
/// `Err` means the frame is structurally present but fails verification.
pub fn decode_frame(buf: &[u8]) -> Result<Option<Frame<'_>>> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }
    let lsn = get_u64(buf, 0);
    let stored_crc = get_u32(buf, 8);
    let len = get_u16(buf, 13) as usize;
    if buf.len() < RECORD_HEADER_SIZE + len {
        return Ok(None);
    }
    let end = RECORD_HEADER_SIZE + len;
    if crc32c::crc32c(&buf[12..end]) != stored_crc {
        return Err(Error::Corruption(format!("WAL frame CRC mismatch at LSN {lsn}")));
    }
    let kind = RecordType::from_u8(buf[12])
        .ok_or_else(|| Error::Corruption(format!("unknown WAL record type {}", buf[12])))?;
    Ok(Some(Frame {
        lsn,
        kind,
        payload: &buf[RECORD_HEADER_SIZE..end],
        size: end,
    }))
}
