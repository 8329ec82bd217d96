use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

pub type PageId = u64;

/// On-disk magic: "DBP" + format version 1.
pub const PAGE_MAGIC: [u8; 4] = [0x44, 0x42, 0x50, 0x01];

/// Fixed header: magic(4) type(1) pad(3) page_id(8) slot_count(2)
/// free_offset(2) crc32(4).
pub const PAGE_HEADER_LEN: usize = 24;

/// Slot directory entry: offset(2) length(2) flags(2).
pub const SLOT_LEN: usize = 6;

pub const SLOT_LIVE: u16 = 1;
pub const SLOT_TOMBSTONE: u16 = 2;

const OFF_TYPE: usize = 4;
const OFF_PAGE_ID: usize = 8;
const OFF_SLOT_COUNT: usize = 16;
const OFF_FREE_OFFSET: usize = 18;
const OFF_CRC: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageType {
    Data,
    IndexInternal,
    IndexLeaf,
    HashBucket,
    FreeSpace,
    Meta,
}

impl PageType {
    pub fn as_u8(self) -> u8 {
        match self {
            PageType::Data => 0,
            PageType::IndexInternal => 1,
            PageType::IndexLeaf => 2,
            PageType::HashBucket => 3,
            PageType::FreeSpace => 4,
            PageType::Meta => 5,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PageType::Data,
            1 => PageType::IndexInternal,
            2 => PageType::IndexLeaf,
            3 => PageType::HashBucket,
            4 => PageType::FreeSpace,
            5 => PageType::Meta,
            other => {
                return Err(DbError::Corruption(format!(
                    "unknown page type tag {other}"
                )))
            }
        })
    }
}

/// One slot directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub length: usize,
    pub flags: u16,
}

impl Slot {
    pub fn is_live(&self) -> bool {
        self.flags == SLOT_LIVE
    }
}

/// A fixed-size page: 24-byte header, slot directory growing up from the
/// header, record bodies growing down from the tail.
///
/// The free-space offset is stored as u16; a stored 0 means "page size"
/// (an offset inside the header can never start a record body, and a full
/// 64 KiB page would not otherwise fit the field).
#[derive(Debug, Clone)]
pub struct Page {
    data: Vec<u8>,
    dirty: bool,
}

impl Page {
    pub fn new(id: PageId, page_type: PageType, size: usize) -> Self {
        let mut data = vec![0u8; size];
        data[..4].copy_from_slice(&PAGE_MAGIC);
        data[OFF_TYPE] = page_type.as_u8();
        data[OFF_PAGE_ID..OFF_PAGE_ID + 8].copy_from_slice(&id.to_le_bytes());
        let mut page = Self { data, dirty: true };
        page.set_free_offset(size);
        page
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, dirty: false }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn id(&self) -> PageId {
        u64::from_le_bytes(self.data[OFF_PAGE_ID..OFF_PAGE_ID + 8].try_into().unwrap())
    }

    pub fn magic_ok(&self) -> bool {
        self.data[..4] == PAGE_MAGIC
    }

    pub fn page_type(&self) -> Result<PageType> {
        PageType::from_u8(self.data[OFF_TYPE])
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    // Little-endian typed accessors.

    pub fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes(self.data[at..at + 2].try_into().unwrap())
    }

    pub fn write_u16(&mut self, at: usize, v: u16) {
        self.data[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, at: usize, v: u32) {
        self.data[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn read_u64(&self, at: usize) -> u64 {
        u64::from_le_bytes(self.data[at..at + 8].try_into().unwrap())
    }

    pub fn write_u64(&mut self, at: usize, v: u64) {
        self.data[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn read_bytes(&self, at: usize, len: usize) -> &[u8] {
        &self.data[at..at + len]
    }

    pub fn write_bytes(&mut self, at: usize, bytes: &[u8]) {
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    // Header fields.

    pub fn slot_count(&self) -> usize {
        self.read_u16(OFF_SLOT_COUNT) as usize
    }

    fn set_slot_count(&mut self, n: usize) {
        self.write_u16(OFF_SLOT_COUNT, n as u16);
    }

    pub fn free_offset(&self) -> usize {
        match self.read_u16(OFF_FREE_OFFSET) {
            0 => self.size(),
            raw => raw as usize,
        }
    }

    fn set_free_offset(&mut self, off: usize) {
        let raw = if off > u16::MAX as usize { 0 } else { off as u16 };
        self.write_u16(OFF_FREE_OFFSET, raw);
    }

    // Checksum. The stored CRC is refreshed only when the pager serializes
    // the page to disk.

    pub fn compute_crc(&self) -> u32 {
        crc32fast::hash(&self.data[PAGE_HEADER_LEN..])
    }

    pub fn stored_crc(&self) -> u32 {
        self.read_u32(OFF_CRC)
    }

    pub fn update_crc(&mut self) {
        let crc = self.compute_crc();
        self.write_u32(OFF_CRC, crc);
    }

    pub fn verify_crc(&self) -> bool {
        self.stored_crc() == self.compute_crc()
    }

    // Slot directory.

    fn slot_at(&self, idx: usize) -> usize {
        PAGE_HEADER_LEN + idx * SLOT_LEN
    }

    pub fn slot(&self, idx: usize) -> Option<Slot> {
        if idx >= self.slot_count() {
            return None;
        }
        let at = self.slot_at(idx);
        Some(Slot {
            offset: self.read_u16(at) as usize,
            length: self.read_u16(at + 2) as usize,
            flags: self.read_u16(at + 4),
        })
    }

    fn set_slot(&mut self, idx: usize, slot: Slot) {
        let at = self.slot_at(idx);
        self.write_u16(at, slot.offset as u16);
        self.write_u16(at + 2, slot.length as u16);
        self.write_u16(at + 4, slot.flags);
    }

    /// Bytes of the record stored in a slot. Tombstoned slots yield `None`.
    pub fn record(&self, idx: usize) -> Option<&[u8]> {
        let slot = self.slot(idx)?;
        if !slot.is_live() {
            return None;
        }
        Some(&self.data[slot.offset..slot.offset + slot.length])
    }

    /// Contiguous free bytes between the slot directory and the record area.
    pub fn free_contiguous(&self) -> usize {
        self.free_offset() - (PAGE_HEADER_LEN + self.slot_count() * SLOT_LEN)
    }

    /// Total reclaimable bytes: the contiguous gap plus dead record space
    /// recoverable by compaction.
    pub fn free_total(&self) -> usize {
        let live: usize = (0..self.slot_count())
            .filter_map(|i| self.slot(i))
            .filter(Slot::is_live)
            .map(|s| s.length)
            .sum();
        self.free_contiguous() + (self.size() - self.free_offset()) - live
    }

    fn first_tombstone(&self) -> Option<usize> {
        (0..self.slot_count()).find(|&i| {
            self.slot(i)
                .map(|s| s.flags == SLOT_TOMBSTONE)
                .unwrap_or(false)
        })
    }

    /// Space needed to place `len` record bytes on this page (slot entry
    /// included unless a tombstoned one can be reused).
    pub fn required_for(&self, len: usize) -> usize {
        if self.first_tombstone().is_some() {
            len
        } else {
            len + SLOT_LEN
        }
    }

    /// Append a record body, reusing a tombstoned slot entry when one
    /// exists. Returns the slot index, or `None` when the contiguous free
    /// space cannot hold it.
    pub fn append_record(&mut self, bytes: &[u8]) -> Option<usize> {
        let reuse = self.first_tombstone();
        let need = if reuse.is_some() {
            bytes.len()
        } else {
            bytes.len() + SLOT_LEN
        };
        if self.free_contiguous() < need {
            return None;
        }

        let offset = self.free_offset() - bytes.len();
        let idx = match reuse {
            Some(idx) => idx,
            None => {
                let idx = self.slot_count();
                self.set_slot_count(idx + 1);
                idx
            }
        };
        self.write_bytes(offset, bytes);
        self.set_free_offset(offset);
        self.set_slot(
            idx,
            Slot {
                offset,
                length: bytes.len(),
                flags: SLOT_LIVE,
            },
        );
        self.dirty = true;
        Some(idx)
    }

    /// Overwrite a live record in place. Fails when the new body does not
    /// fit the existing slot.
    pub fn update_record(&mut self, idx: usize, bytes: &[u8]) -> Result<()> {
        let slot = self
            .slot(idx)
            .filter(Slot::is_live)
            .ok_or_else(|| DbError::Corruption(format!("no live record in slot {idx}")))?;
        if bytes.len() > slot.length {
            return Err(DbError::InvalidOperation(
                "record does not fit its slot".to_string(),
            ));
        }
        self.write_bytes(slot.offset, bytes);
        self.set_slot(
            idx,
            Slot {
                offset: slot.offset,
                length: bytes.len(),
                flags: SLOT_LIVE,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Tombstone a slot; the entry stays for reuse, the body space is
    /// reclaimed by compaction.
    pub fn delete_record(&mut self, idx: usize) -> Result<()> {
        let slot = self
            .slot(idx)
            .filter(Slot::is_live)
            .ok_or_else(|| DbError::Corruption(format!("no live record in slot {idx}")))?;
        self.set_slot(
            idx,
            Slot {
                offset: slot.offset,
                length: slot.length,
                flags: SLOT_TOMBSTONE,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Rewrite live record bodies contiguously at the tail. Slot indexes
    /// are stable; only offsets move.
    pub fn compact(&mut self) {
        let mut live: Vec<(usize, Vec<u8>)> = (0..self.slot_count())
            .filter_map(|i| {
                let s = self.slot(i)?;
                s.is_live()
                    .then(|| (i, self.data[s.offset..s.offset + s.length].to_vec()))
            })
            .collect();
        // Copies are staged out of the page, so rewrite order is free; keep
        // slot order for locality.
        live.sort_by_key(|(i, _)| *i);

        let mut offset = self.size();
        for (idx, bytes) in live {
            offset -= bytes.len();
            let length = bytes.len();
            self.write_bytes(offset, bytes.as_slice());
            self.set_slot(
                idx,
                Slot {
                    offset,
                    length,
                    flags: SLOT_LIVE,
                },
            );
        }
        self.set_free_offset(offset);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let page = Page::new(1, PageType::Data, 4096);
        assert_eq!(page.id(), 1);
        assert_eq!(page.size(), 4096);
        assert!(page.magic_ok());
        assert_eq!(page.page_type().unwrap(), PageType::Data);
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.free_offset(), 4096);
    }

    #[test]
    fn test_append_and_read_records() {
        let mut page = Page::new(3, PageType::Data, 4096);
        let a = page.append_record(b"hello").unwrap();
        let b = page.append_record(b"world!").unwrap();
        assert_eq!(page.record(a).unwrap(), b"hello");
        assert_eq!(page.record(b).unwrap(), b"world!");
        assert_eq!(page.slot_count(), 2);
    }

    #[test]
    fn test_tombstone_slot_reuse() {
        let mut page = Page::new(3, PageType::Data, 4096);
        let a = page.append_record(b"first").unwrap();
        page.delete_record(a).unwrap();
        assert!(page.record(a).is_none());

        let c = page.append_record(b"second").unwrap();
        assert_eq!(c, a);
        assert_eq!(page.slot_count(), 1);
    }

    #[test]
    fn test_in_place_update() {
        let mut page = Page::new(3, PageType::Data, 4096);
        let idx = page.append_record(b"abcdef").unwrap();
        page.update_record(idx, b"xyz").unwrap();
        assert_eq!(page.record(idx).unwrap(), b"xyz");
        assert!(page.update_record(idx, b"longer than before").is_err());
    }

    #[test]
    fn test_compaction_reclaims_dead_space() {
        let mut page = Page::new(3, PageType::Data, 4096);
        let a = page.append_record(&[1u8; 1000]).unwrap();
        let b = page.append_record(&[2u8; 1000]).unwrap();
        page.delete_record(a).unwrap();

        let before = page.free_contiguous();
        page.compact();
        assert!(page.free_contiguous() >= before + 1000);
        assert_eq!(page.record(b).unwrap(), &[2u8; 1000][..]);
    }

    #[test]
    fn test_append_respects_capacity() {
        let mut page = Page::new(3, PageType::Data, 4096);
        assert!(page.append_record(&[0u8; 5000]).is_none());
        let free = page.free_contiguous();
        assert!(page.append_record(&[0u8; 4090]).is_none());
        assert_eq!(page.free_contiguous(), free);
    }

    #[test]
    fn test_crc_round_trip() {
        let mut page = Page::new(9, PageType::Data, 4096);
        page.append_record(b"payload").unwrap();
        page.update_crc();
        assert!(page.verify_crc());

        page.as_bytes_mut()[100] ^= 0xFF;
        assert!(!page.verify_crc());
    }
}
