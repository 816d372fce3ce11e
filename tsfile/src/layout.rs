//! On-disk layout of a TSFile.
//!
//! Pages are 4096 bytes. Two shapes exist:
//!
//! - **V1**: page 0 carries the 72-byte file header followed by a single
//!   schema blob. Every further page is a data page for that one schema,
//!   sized to a whole multiple of the record size, with no in-page header.
//! - **V2**: every page is 4096 bytes at `page_id * 4096`. Header pages sit
//!   at page ids 0, 240, 480, …; each holds a full file header (own magic,
//!   flags, super-blocks) followed by 240 page descriptors, one per page of
//!   its window (`page_id % 240` selects the slot). Data pages are either
//!   schema pages (a single schema blob) or entry pages (raw records).
//!
//! File header (72 bytes):
//! - Bytes 0-5: magic `TSFILE`
//! - Bytes 6-7: format flags (u16)
//! - Bytes 8-71: 4 x super-block {time: u64, count: u32, pad: u32}
//!
//! Page descriptor (16 bytes): {tag: u16, flags: u16, count: u32, pad: u64}.
//!
//! All integers little-endian. The super-block with the largest non-zero
//! time stamp is authoritative; `count` means entries in V1 and pages in V2.

use std::io::Cursor;

use binrw::{binrw, BinReaderExt, BinWrite};

use crate::error::{Error, Result};

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// File magic, first six bytes of page 0.
pub const MAGIC: [u8; 6] = *b"TSFILE";

/// Byte size of the file header (magic + flags + 4 super-blocks).
pub const HEADER_SIZE: usize = 72;

/// Number of rotating super-block slots.
pub const SUPER_BLOCK_COUNT: usize = 4;

/// Byte size of one page descriptor.
pub const DESCRIPTOR_SIZE: usize = 16;

/// Descriptors per V2 header page; also the header-page stride.
pub const TAGS_PER_HEADER: u32 = 240;

/// Tag of an unallocated page slot.
pub const TAG_EMPTY: u16 = 0;

/// Tag of a header page.
pub const TAG_HEADER: u16 = 1;

/// First data tag; `tag - TAG_DATA_BASE` is the schema id.
pub const TAG_DATA_BASE: u16 = 32;

/// Format flag: V1 single-schema layout.
pub const FORMAT_V1: u16 = 0x1;
/// Format flag: V2 multi-schema layout.
pub const FORMAT_V2: u16 = 0x2;
/// Format flag: V1 extension types (boolean, start-time, end-time).
pub const FORMAT_EXT: u16 = 0x10;

const FORMAT_KNOWN: u16 = FORMAT_V1 | FORMAT_V2 | FORMAT_EXT;

/// Descriptor flag: the page holds a schema blob, not entries.
pub const PF_SCHEMA: u16 = 0x1;

/// One commit-pointer slot. The freshest time stamp wins on load.
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// Commit time in nanoseconds, strictly monotonic per file. Zero means
    /// the slot was never written.
    pub time: u64,
    /// Entries in the file (V1) or pages in the file (V2).
    pub count: u32,
    pub pad: u32,
}

/// The 72-byte preamble of every header page.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: [u8; 6],
    pub flags: u16,
    pub super_blocks: [SuperBlock; SUPER_BLOCK_COUNT],
}

impl FileHeader {
    pub fn new(flags: u16) -> Self {
        Self {
            magic: MAGIC,
            flags,
            super_blocks: [SuperBlock::default(); SUPER_BLOCK_COUNT],
        }
    }

    /// The super-block with the largest non-zero time stamp, if any slot was
    /// ever committed. Ties cannot happen under a single writer; on reload
    /// the scan order breaks them.
    pub fn authoritative(&self) -> Option<&SuperBlock> {
        self.super_blocks
            .iter()
            .filter(|sb| sb.time != 0)
            .max_by_key(|sb| sb.time)
    }

    /// Check magic and flag combination. Exactly one of V1/V2 must be set
    /// and no unknown bits may appear.
    pub fn check(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Format(format!("bad magic {:02x?}", self.magic)));
        }
        check_format_flags(self.flags)
    }

    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        self.write_le(&mut cursor)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let header: FileHeader = cursor.read_le()?;
        Ok(header)
    }
}

/// Reject unknown or contradictory format flags.
pub fn check_format_flags(flags: u16) -> Result<()> {
    if flags & !FORMAT_KNOWN != 0 {
        return Err(Error::Format(format!("unknown format flags 0x{flags:x}")));
    }
    match (flags & FORMAT_V1 != 0, flags & FORMAT_V2 != 0) {
        (true, false) | (false, true) => Ok(()),
        _ => Err(Error::Format(format!(
            "exactly one of V1/V2 must be set, got 0x{flags:x}"
        ))),
    }
}

/// Per-page descriptor stored centrally in header pages (V2 only).
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageDescriptor {
    pub tag: u16,
    pub flags: u16,
    /// Records in the page; zero for header and schema pages.
    pub count: u32,
    pub pad: u64,
}

impl PageDescriptor {
    pub fn is_schema(&self) -> bool {
        self.flags & PF_SCHEMA != 0
    }

    pub fn to_bytes(&self) -> Result<[u8; DESCRIPTOR_SIZE]> {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        self.write_le(&mut cursor)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Ok(cursor.read_le::<PageDescriptor>()?)
    }
}

/// Records that fit one page for the given entry size.
pub fn records_per_page(entry_size: usize) -> u32 {
    (PAGE_SIZE / entry_size) as u32
}

/// Byte size of a V1 data page: a whole multiple of the record size.
pub fn v1_data_page_size(entry_size: usize) -> usize {
    records_per_page(entry_size) as usize * entry_size
}

/// Byte offset of V1 page `page_id` (page 0 is the header page).
pub fn v1_page_offset(page_id: u32, entry_size: usize) -> u64 {
    debug_assert!(page_id >= 1);
    PAGE_SIZE as u64 + (page_id as u64 - 1) * v1_data_page_size(entry_size) as u64
}

/// Byte offset of V2 page `page_id`.
pub fn v2_page_offset(page_id: u32) -> u64 {
    page_id as u64 * PAGE_SIZE as u64
}

/// True if `page_id` is reserved for a header page in V2.
pub fn is_header_page(page_id: u32) -> bool {
    page_id % TAGS_PER_HEADER == 0
}

/// The header page describing `page_id` in V2.
pub fn header_page_of(page_id: u32) -> u32 {
    (page_id / TAGS_PER_HEADER) * TAGS_PER_HEADER
}

/// The descriptor slot of `page_id` inside its header page.
pub fn descriptor_slot(page_id: u32) -> usize {
    (page_id % TAGS_PER_HEADER) as usize
}

/// Byte offset of a descriptor slot inside its header page.
pub fn descriptor_offset(page_id: u32) -> usize {
    HEADER_SIZE + descriptor_slot(page_id) * DESCRIPTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        let header = FileHeader::new(FORMAT_V2);
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..6], b"TSFILE");

        let back = FileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let desc = PageDescriptor { tag: 33, flags: PF_SCHEMA, count: 0, pad: 0 };
        let bytes = desc.to_bytes().unwrap();
        assert_eq!(bytes.len(), DESCRIPTOR_SIZE);
        assert_eq!(PageDescriptor::from_bytes(&bytes).unwrap(), desc);
    }

    #[test]
    fn test_authoritative_superblock() {
        let mut header = FileHeader::new(FORMAT_V2);
        assert!(header.authoritative().is_none());

        header.super_blocks[0] = SuperBlock { time: 10, count: 1, pad: 0 };
        header.super_blocks[2] = SuperBlock { time: 30, count: 3, pad: 0 };
        header.super_blocks[3] = SuperBlock { time: 20, count: 2, pad: 0 };
        let best = header.authoritative().unwrap();
        assert_eq!(best.time, 30);
        assert_eq!(best.count, 3);
    }

    #[test]
    fn test_format_flags() {
        assert!(check_format_flags(FORMAT_V1).is_ok());
        assert!(check_format_flags(FORMAT_V2).is_ok());
        assert!(check_format_flags(FORMAT_V1 | FORMAT_EXT).is_ok());
        assert!(check_format_flags(FORMAT_V1 | FORMAT_V2).is_err());
        assert!(check_format_flags(0).is_err());
        assert!(check_format_flags(0x40).is_err());
    }

    #[test]
    fn test_v1_page_math() {
        // 12-byte records: 341 fit, data pages are 4092 bytes.
        assert_eq!(records_per_page(12), 341);
        assert_eq!(v1_data_page_size(12), 4092);
        assert_eq!(v1_page_offset(1, 12), 4096);
        assert_eq!(v1_page_offset(3, 12), 4096 + 2 * 4092);
    }

    #[test]
    fn test_v2_header_page_math() {
        assert!(is_header_page(0));
        assert!(is_header_page(240));
        assert!(!is_header_page(239));
        assert_eq!(header_page_of(241), 240);
        assert_eq!(descriptor_slot(241), 1);
        assert_eq!(descriptor_offset(5), HEADER_SIZE + 5 * DESCRIPTOR_SIZE);
    }
}
