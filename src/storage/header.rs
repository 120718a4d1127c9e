/// Database file header, stored at the front of page 1.
use crate::error::{Error, Result};
use crate::storage::page::{
    get_u16, get_u32, get_u64, is_valid_page_size, put_u16, put_u32, put_u64, Lsn, PageId,
};

pub const MAGIC: &[u8; 16] = b"CalicoDB\x00\x00\x00\x00\x00\x00\x00\x00";
pub const HEADER_SIZE: usize = 62;

const MAGIC_OFFSET: usize = 0;
const PAGE_SIZE_OFFSET: usize = 16;
const PAGE_COUNT_OFFSET: usize = 18;
const FREELIST_HEAD_OFFSET: usize = 26;
const RECORD_COUNT_OFFSET: usize = 34;
const COMMIT_LSN_OFFSET: usize = 42;
const TREE_ROOT_OFFSET: usize = 50;
const CRC_OFFSET: usize = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: usize,
    pub page_count: u64,
    pub freelist_head: PageId,
    pub record_count: u64,
    pub last_commit_lsn: Lsn,
    pub tree_root: PageId,
}

impl FileHeader {
    pub fn new(page_size: usize) -> Self {
        FileHeader {
            page_size,
            page_count: 1,
            freelist_head: PageId::NULL,
            record_count: 0,
            last_commit_lsn: 0,
            tree_root: PageId::NULL,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_SIZE);
        out[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()].copy_from_slice(MAGIC);
        put_u16(out, PAGE_SIZE_OFFSET, self.page_size as u16);
        put_u64(out, PAGE_COUNT_OFFSET, self.page_count);
        put_u64(out, FREELIST_HEAD_OFFSET, self.freelist_head.0);
        put_u64(out, RECORD_COUNT_OFFSET, self.record_count);
        put_u64(out, COMMIT_LSN_OFFSET, self.last_commit_lsn);
        put_u64(out, TREE_ROOT_OFFSET, self.tree_root.0);
        let crc = crc32c::crc32c(&out[..CRC_OFFSET]);
        put_u32(out, CRC_OFFSET, crc);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corruption("file header truncated".into()));
        }
        if &buf[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] != MAGIC {
            return Err(Error::InvalidArgument(
                "not a database file (bad magic)".into(),
            ));
        }
        let stored_crc = get_u32(buf, CRC_OFFSET);
        if crc32c::crc32c(&buf[..CRC_OFFSET]) != stored_crc {
            return Err(Error::Corruption("file header CRC mismatch".into()));
        }
        // 16 KiB pages encode as 16384 which fits u16; 32768 likewise.
        let page_size = get_u16(buf, PAGE_SIZE_OFFSET) as usize;
        if !is_valid_page_size(page_size) {
            return Err(Error::Corruption(format!(
                "impossible page size {page_size} in header"
            )));
        }
        Ok(FileHeader {
            page_size,
            page_count: get_u64(buf, PAGE_COUNT_OFFSET),
            freelist_head: PageId(get_u64(buf, FREELIST_HEAD_OFFSET)),
            record_count: get_u64(buf, RECORD_COUNT_OFFSET),
            last_commit_lsn: get_u64(buf, COMMIT_LSN_OFFSET),
            tree_root: PageId(get_u64(buf, TREE_ROOT_OFFSET)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let header = FileHeader {
            page_size: 4096,
            page_count: 17,
            freelist_head: PageId(9),
            record_count: 123,
            last_commit_lsn: 456,
            tree_root: PageId(2),
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(FileHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn crc_detects_flipped_byte() {
        let mut buf = [0u8; HEADER_SIZE];
        FileHeader::new(4096).encode(&mut buf);
        buf[PAGE_COUNT_OFFSET] ^= 0x01;
        let err = FileHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn bad_magic_is_invalid_argument() {
        let mut buf = [0u8; HEADER_SIZE];
        FileHeader::new(4096).encode(&mut buf);
        buf[0] = b'X';
        let err = FileHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn impossible_page_size_is_corruption() {
        let mut buf = [0u8; HEADER_SIZE];
        FileHeader::new(4096).encode(&mut buf);
        put_u16(&mut buf, PAGE_SIZE_OFFSET, 1000);
        let crc = crc32c::crc32c(&buf[..CRC_OFFSET]);
        put_u32(&mut buf, CRC_OFFSET, crc);
        let err = FileHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
