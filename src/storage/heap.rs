// # Record Heap
//
// Lays variable-length record bytes onto DATA pages through the buffer
// manager. Page 0 of every heap file is the META page (durable LSN +
// free-space chain head); DATA pages hold slotted records; FREESPACE pages
// persist the placement map so a clean open can skip the heap scan.
//
// Placement: first page whose contiguous free block fits the record. A page
// with enough total-but-fragmented space is compacted in place during
// insert. Updates stay in place when the new bytes fit the slot, otherwise
// the record moves and the old slot becomes a tombstone.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::manager::BufferManager;
use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageId, PageType, PAGE_HEADER_LEN, SLOT_LEN};
use crate::wal::Lsn;

/// META page body layout (relative to the page header).
const META_DURABLE_LSN: usize = PAGE_HEADER_LEN;
const META_FREESPACE_HEAD: usize = PAGE_HEADER_LEN + 8;

/// FREESPACE page body layout: next page id (8), entry count (2), then
/// 12-byte entries of page_id(8) contig(2) total(2).
const FS_NEXT: usize = PAGE_HEADER_LEN;
const FS_COUNT: usize = PAGE_HEADER_LEN + 8;
const FS_ENTRIES: usize = PAGE_HEADER_LEN + 10;
const FS_ENTRY_LEN: usize = 12;

/// Pages whose dead (fragmented) space exceeds this fraction of the page
/// are compacted during insert.
const COMPACT_DEAD_FRACTION: usize = 4;

/// Address of a record in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLocator {
    pub page_id: PageId,
    pub slot: u16,
}

/// Free-space bookkeeping for one data page.
#[derive(Debug, Clone, Copy)]
struct FreeInfo {
    contiguous: usize,
    total: usize,
}

/// Bucketed free-space map: pages grouped by contiguous-free-space bucket
/// so placement does not scan every page.
#[derive(Debug, Default)]
struct FreeSpaceMap {
    info: HashMap<PageId, FreeInfo>,
    buckets: BTreeMap<usize, BTreeSet<PageId>>,
}

impl FreeSpaceMap {
    fn bucket_of(contiguous: usize) -> usize {
        contiguous / 256
    }

    fn update(&mut self, page_id: PageId, contiguous: usize, total: usize) {
        if let Some(old) = self.info.remove(&page_id) {
            if let Some(set) = self.buckets.get_mut(&Self::bucket_of(old.contiguous)) {
                set.remove(&page_id);
            }
        }
        self.info.insert(page_id, FreeInfo { contiguous, total });
        self.buckets
            .entry(Self::bucket_of(contiguous))
            .or_default()
            .insert(page_id);
    }

    /// A page whose contiguous block can hold `required` bytes, or one that
    /// could after compaction (returned with `needs_compaction = true`).
    fn find(&self, required: usize) -> Option<(PageId, bool)> {
        for (_, pages) in self.buckets.range(Self::bucket_of(required)..) {
            for &page_id in pages {
                if self.info[&page_id].contiguous >= required {
                    return Some((page_id, false));
                }
            }
        }
        self.info
            .iter()
            .find(|(_, i)| i.total >= required)
            .map(|(&id, _)| (id, true))
    }

    fn entries(&self) -> Vec<(PageId, FreeInfo)> {
        let mut out: Vec<_> = self.info.iter().map(|(&k, &v)| (k, v)).collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }
}

pub struct RecordHeap {
    buffer: Arc<BufferManager>,
    page_size: usize,
    freespace: Mutex<FreeSpaceMap>,
}

impl RecordHeap {
    /// Open the heap over a buffer manager, creating the META page in a
    /// fresh file.
    pub fn open(buffer: Arc<BufferManager>) -> Result<Self> {
        let page_size = buffer.pager().page_size();
        if buffer.pager().page_count() == 0 {
            let meta = buffer.allocate(PageType::Meta)?;
            debug_assert_eq!(meta.id(), 0);
            buffer.unpin(meta.id())?;
            buffer.flush(0)?;
        }
        Ok(Self {
            buffer,
            page_size,
            freespace: Mutex::new(FreeSpaceMap::default()),
        })
    }

    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    pub fn durable_lsn(&self) -> Result<Lsn> {
        self.buffer.with_page(0, |p| p.read_u64(META_DURABLE_LSN))
    }

    /// Store record bytes, returning their locator.
    pub fn put(&self, bytes: &[u8]) -> Result<RecordLocator> {
        let max_record = self.page_size - PAGE_HEADER_LEN - SLOT_LEN;
        if bytes.len() > max_record {
            return Err(DbError::EntityTooLarge {
                size: bytes.len(),
                limit: max_record,
            });
        }

        let mut freespace = self.freespace.lock();
        let required = bytes.len() + SLOT_LEN;

        let page_id = match freespace.find(required) {
            Some((page_id, needs_compaction)) => {
                if needs_compaction {
                    self.buffer.with_page_mut(page_id, Page::compact)?;
                    debug!(page_id, "compacted page during insert");
                }
                page_id
            }
            None => {
                let page = self.buffer.allocate(PageType::Data)?;
                let id = page.id();
                self.buffer.unpin(id)?;
                id
            }
        };

        let (slot, contig, total) = self.buffer.with_page_mut(page_id, |p| {
            let slot = p.append_record(bytes);
            (slot, p.free_contiguous(), p.free_total())
        })?;
        freespace.update(page_id, contig, total);

        let slot = slot.ok_or_else(|| {
            DbError::Corruption(format!("free-space map overstated page {page_id}"))
        })?;
        Ok(RecordLocator {
            page_id,
            slot: slot as u16,
        })
    }

    /// Fetch a deep copy of the record at a locator.
    pub fn get(&self, locator: RecordLocator) -> Result<Vec<u8>> {
        self.buffer
            .with_page(locator.page_id, |p| {
                p.record(locator.slot as usize).map(<[u8]>::to_vec)
            })?
            .ok_or_else(|| {
                DbError::NotFound(format!(
                    "no live record at page {} slot {}",
                    locator.page_id, locator.slot
                ))
            })
    }

    /// Rewrite a record. Keeps the locator when the new bytes fit in place,
    /// otherwise relocates and tombstones the old slot.
    pub fn update(&self, locator: RecordLocator, bytes: &[u8]) -> Result<RecordLocator> {
        let fits = self.buffer.with_page_mut(locator.page_id, |p| {
            match p.slot(locator.slot as usize) {
                Some(slot) if slot.is_live() && bytes.len() <= slot.length => {
                    p.update_record(locator.slot as usize, bytes)?;
                    Ok(true)
                }
                Some(slot) if slot.is_live() => Ok(false),
                _ => Err(DbError::NotFound(format!(
                    "no live record at page {} slot {}",
                    locator.page_id, locator.slot
                ))),
            }
        })??;

        if fits {
            self.refresh_freespace(locator.page_id)?;
            return Ok(locator);
        }

        let new_locator = self.put(bytes)?;
        self.delete(locator)?;
        Ok(new_locator)
    }

    /// Tombstone the record at a locator.
    pub fn delete(&self, locator: RecordLocator) -> Result<()> {
        self.buffer
            .with_page_mut(locator.page_id, |p| p.delete_record(locator.slot as usize))??;
        self.refresh_freespace(locator.page_id)
    }

    fn refresh_freespace(&self, page_id: PageId) -> Result<()> {
        let (contig, total) = self
            .buffer
            .with_page(page_id, |p| (p.free_contiguous(), p.free_total()))?;
        self.freespace.lock().update(page_id, contig, total);
        Ok(())
    }

    /// Scan every live record, straight from the pager. Used on open before
    /// the cache holds anything; `verify` forces checksum checks regardless
    /// of configuration (recovery always verifies).
    pub fn scan(&self, verify: bool) -> Result<Vec<(RecordLocator, Vec<u8>)>> {
        let pager = self.buffer.pager();
        let mut out = Vec::new();
        let mut freespace = self.freespace.lock();

        for page_id in 1..pager.page_count() {
            let page = pager.read_with(page_id, verify)?;
            if page.page_type()? != PageType::Data {
                continue;
            }
            for slot in 0..page.slot_count() {
                if let Some(bytes) = page.record(slot) {
                    out.push((
                        RecordLocator {
                            page_id,
                            slot: slot as u16,
                        },
                        bytes.to_vec(),
                    ));
                }
            }
            freespace.update(page_id, page.free_contiguous(), page.free_total());
        }
        Ok(out)
    }

    /// Load the persisted free-space chain; true when one was present.
    pub fn load_freespace(&self) -> Result<bool> {
        let head = self
            .buffer
            .with_page(0, |p| p.read_u64(META_FREESPACE_HEAD))?;
        if head == 0 {
            return Ok(false);
        }

        let mut freespace = self.freespace.lock();
        let mut next = head;
        while next != 0 {
            let page = self.buffer.peek(next)?;
            if page.page_type()? != PageType::FreeSpace {
                return Err(DbError::Corruption(format!(
                    "free-space chain points at page {next} of the wrong type"
                )));
            }
            let count = page.read_u16(FS_COUNT) as usize;
            for i in 0..count {
                let at = FS_ENTRIES + i * FS_ENTRY_LEN;
                let page_id = page.read_u64(at);
                let contig = page.read_u16(at + 8) as usize;
                let total = page.read_u16(at + 10) as usize;
                freespace.update(page_id, contig, total);
            }
            next = page.read_u64(FS_NEXT);
        }
        Ok(true)
    }

    /// Persist the free-space map into FREESPACE pages, stamp the durable
    /// LSN, and flush everything to disk.
    pub fn flush(&self, durable_lsn: Lsn) -> Result<()> {
        let entries = self.freespace.lock().entries();
        let per_page = (self.page_size - FS_ENTRIES) / FS_ENTRY_LEN;

        // Collect the existing chain for reuse.
        let mut chain = Vec::new();
        let mut next = self
            .buffer
            .with_page(0, |p| p.read_u64(META_FREESPACE_HEAD))?;
        while next != 0 {
            chain.push(next);
            next = self.buffer.with_page(next, |p| p.read_u64(FS_NEXT))?;
        }

        let mut needed = entries.chunks(per_page).count();
        if needed == 0 {
            needed = 1;
        }
        while chain.len() < needed {
            let page = self.buffer.allocate(PageType::FreeSpace)?;
            let id = page.id();
            self.buffer.unpin(id)?;
            chain.push(id);
        }
        // Surplus chain pages go back to the pager's free list.
        for &surplus in &chain[needed..] {
            self.buffer.evict(surplus)?;
            self.buffer.pager().release(surplus);
        }
        chain.truncate(needed);

        let mut chunks: Vec<&[(PageId, FreeInfo)]> = entries.chunks(per_page).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for (i, (&fs_page, chunk)) in chain.iter().zip(chunks.iter()).enumerate() {
            let next = chain.get(i + 1).copied().unwrap_or(0);
            self.buffer.with_page_mut(fs_page, |p| {
                p.write_u64(FS_NEXT, next);
                p.write_u16(FS_COUNT, chunk.len() as u16);
                for (j, (page_id, info)) in chunk.iter().enumerate() {
                    let at = FS_ENTRIES + j * FS_ENTRY_LEN;
                    p.write_u64(at, *page_id);
                    p.write_u16(at + 8, info.contiguous as u16);
                    p.write_u16(at + 10, info.total as u16);
                }
            })?;
        }

        let head = chain[0];
        self.buffer.with_page_mut(0, |p| {
            p.write_u64(META_FREESPACE_HEAD, head);
            p.write_u64(META_DURABLE_LSN, durable_lsn);
        })?;
        self.buffer.flush_all()
    }
}

impl std::fmt::Debug for RecordHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordHeap")
            .field("page_size", &self.page_size)
            .field("tracked_pages", &self.freespace.lock().info.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::Pager;
    use tempfile::tempdir;

    fn heap(capacity: usize) -> (tempfile::TempDir, RecordHeap) {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Pager::open(dir.path().join("heap.db"), 4096, true).unwrap());
        let buffer = Arc::new(BufferManager::new(pager, capacity));
        let heap = RecordHeap::open(buffer).unwrap();
        (dir, heap)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, heap) = heap(16);
        let loc = heap.put(b"record one").unwrap();
        assert_eq!(heap.get(loc).unwrap(), b"record one");
    }

    #[test]
    fn test_put_spills_to_new_pages() {
        let (_dir, heap) = heap(16);
        let big = vec![7u8; 1500];
        let locs: Vec<_> = (0..6).map(|_| heap.put(&big).unwrap()).collect();
        let pages: BTreeSet<_> = locs.iter().map(|l| l.page_id).collect();
        assert!(pages.len() >= 3);
        for loc in locs {
            assert_eq!(heap.get(loc).unwrap(), big);
        }
    }

    #[test]
    fn test_update_in_place_keeps_locator() {
        let (_dir, heap) = heap(16);
        let loc = heap.put(b"abcdefgh").unwrap();
        let same = heap.update(loc, b"xyz").unwrap();
        assert_eq!(same, loc);
        assert_eq!(heap.get(loc).unwrap(), b"xyz");
    }

    #[test]
    fn test_update_relocates_when_grown() {
        let (_dir, heap) = heap(16);
        let loc = heap.put(b"tiny").unwrap();
        let grown = vec![9u8; 600];
        let moved = heap.update(loc, &grown).unwrap();
        assert_ne!(moved, loc);
        assert_eq!(heap.get(moved).unwrap(), grown);
        assert!(heap.get(loc).is_err());
    }

    #[test]
    fn test_delete_then_get_fails() {
        let (_dir, heap) = heap(16);
        let loc = heap.put(b"gone soon").unwrap();
        heap.delete(loc).unwrap();
        assert!(matches!(heap.get(loc), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_deleted_space_is_reused() {
        let (_dir, heap) = heap(16);
        let big = vec![1u8; 3000];
        let loc = heap.put(&big).unwrap();
        heap.delete(loc).unwrap();

        // The tombstoned page should absorb the next insert of similar size.
        let loc2 = heap.put(&big).unwrap();
        assert_eq!(loc2.page_id, loc.page_id);
    }

    #[test]
    fn test_scan_sees_only_live_records() {
        let (_dir, heap) = heap(16);
        let a = heap.put(b"aaa").unwrap();
        let _b = heap.put(b"bbb").unwrap();
        heap.delete(a).unwrap();
        heap.flush(1).unwrap();

        let records = heap.scan(true).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, b"bbb");
    }

    #[test]
    fn test_freespace_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap.db");
        let loc;
        {
            let pager = Arc::new(Pager::open(&path, 4096, true).unwrap());
            let buffer = Arc::new(BufferManager::new(pager, 16));
            let heap = RecordHeap::open(buffer).unwrap();
            loc = heap.put(b"persisted").unwrap();
            heap.flush(42).unwrap();
        }

        let pager = Arc::new(Pager::open(&path, 4096, true).unwrap());
        let buffer = Arc::new(BufferManager::new(pager, 16));
        let heap = RecordHeap::open(buffer).unwrap();
        assert_eq!(heap.durable_lsn().unwrap(), 42);
        assert!(heap.load_freespace().unwrap());
        assert_eq!(heap.get(loc).unwrap(), b"persisted");

        // Placement honors the loaded map: small insert lands on the
        // existing data page.
        let loc2 = heap.put(b"more").unwrap();
        assert_eq!(loc2.page_id, loc.page_id);
    }
}
