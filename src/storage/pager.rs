// # Pager
//
// Raw page I/O against a single file. The pager stays dumb: it reads and
// writes whole pages at `page_id * page_size`, verifies headers and
// checksums, and hands out fresh page ids. Durability across crashes is the
// WAL's job; `flush` only forces the file to disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageId, PageType};

pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, Default)]
pub struct PagerStats {
    pub reads: u64,
    pub writes: u64,
    pub allocations: u64,
    pub syncs: u64,
}

struct PagerInner {
    file: File,
    page_count: u64,
    free_list: Vec<PageId>,
}

pub struct Pager {
    path: PathBuf,
    page_size: usize,
    verify_checksums: bool,
    inner: Mutex<PagerInner>,
    stats: RwLock<PagerStats>,
}

pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(DbError::InvalidPageSize(page_size));
    }
    Ok(())
}

impl Pager {
    pub fn open(path: impl AsRef<Path>, page_size: usize, verify_checksums: bool) -> Result<Self> {
        validate_page_size(page_size)?;

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(DbError::Corruption(format!(
                "{} length {len} is not a multiple of the page size",
                path.display()
            )));
        }

        Ok(Self {
            path,
            page_size,
            verify_checksums,
            inner: Mutex::new(PagerInner {
                file,
                page_count: len / page_size as u64,
                free_list: Vec::new(),
            }),
            stats: RwLock::new(PagerStats::default()),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> u64 {
        self.inner.lock().page_count
    }

    /// Hand out a fresh page, reusing a released id when one is available.
    /// The file itself grows when the page is first written.
    pub fn allocate(&self, page_type: PageType) -> Result<Page> {
        let mut inner = self.inner.lock();
        let id = match inner.free_list.pop() {
            Some(id) => id,
            None => {
                let id = inner.page_count;
                inner.page_count += 1;
                id
            }
        };
        drop(inner);

        self.stats.write().allocations += 1;
        debug!(page_id = id, ?page_type, "allocated page");
        Ok(Page::new(id, page_type, self.page_size))
    }

    /// Return a page id to the free list for reuse. Pages are never removed
    /// from the file.
    pub fn release(&self, page_id: PageId) {
        self.inner.lock().free_list.push(page_id);
    }

    pub fn read(&self, page_id: PageId) -> Result<Page> {
        self.read_with(page_id, self.verify_checksums)
    }

    /// Read with an explicit verification choice; recovery always verifies.
    pub fn read_with(&self, page_id: PageId, verify: bool) -> Result<Page> {
        let mut inner = self.inner.lock();
        if page_id >= inner.page_count {
            return Err(DbError::NotFound(format!(
                "page {page_id} beyond end of {}",
                self.path.display()
            )));
        }

        let offset = page_id * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; self.page_size];
        inner.file.read_exact(&mut data)?;
        drop(inner);

        self.stats.write().reads += 1;

        let page = Page::from_bytes(data);
        if !page.magic_ok() {
            return Err(DbError::Corruption(format!(
                "bad magic on page {page_id}"
            )));
        }
        if page.id() != page_id {
            return Err(DbError::Corruption(format!(
                "page {page_id} stores id {}",
                page.id()
            )));
        }
        if verify && !page.verify_crc() {
            return Err(DbError::ChecksumMismatch { page_id });
        }
        Ok(page)
    }

    /// Serialize a page: refresh the stored CRC, write the bytes, mark the
    /// page clean. Not atomic on its own; the WAL provides durability.
    pub fn write(&self, page: &mut Page) -> Result<()> {
        page.update_crc();

        let offset = page.id() * self.page_size as u64;
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(page.as_bytes())?;
        if page.id() >= inner.page_count {
            inner.page_count = page.id() + 1;
        }
        drop(inner);

        page.mark_clean();
        self.stats.write().writes += 1;
        Ok(())
    }

    /// Force file contents to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        self.stats.write().syncs += 1;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    pub fn stats(&self) -> PagerStats {
        *self.stats.read()
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pager(dir: &std::path::Path, verify: bool) -> Pager {
        Pager::open(dir.join("test.db"), 4096, verify).unwrap()
    }

    #[test]
    fn test_invalid_page_sizes() {
        let dir = tempdir().unwrap();
        for size in [0, 1024, 5000, 131072] {
            let err = Pager::open(dir.path().join("x.db"), size, true);
            assert!(matches!(err, Err(DbError::InvalidPageSize(_))));
        }
    }

    #[test]
    fn test_allocate_write_read() {
        let dir = tempdir().unwrap();
        let pager = pager(dir.path(), true);

        let mut page = pager.allocate(PageType::Data).unwrap();
        assert_eq!(page.id(), 0);
        page.append_record(b"hello").unwrap();
        pager.write(&mut page).unwrap();
        assert!(!page.is_dirty());

        let back = pager.read(0).unwrap();
        assert_eq!(back.record(0).unwrap(), b"hello");
        assert_eq!(pager.page_count(), 1);
    }

    #[test]
    fn test_read_missing_page() {
        let dir = tempdir().unwrap();
        let pager = pager(dir.path(), true);
        assert!(matches!(pager.read(5), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_free_list_reuse() {
        let dir = tempdir().unwrap();
        let pager = pager(dir.path(), true);

        let mut page = pager.allocate(PageType::Data).unwrap();
        pager.write(&mut page).unwrap();
        pager.release(page.id());

        let reused = pager.allocate(PageType::Data).unwrap();
        assert_eq!(reused.id(), page.id());
    }

    #[test]
    fn test_checksum_verification_on_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let pager = Pager::open(&path, 4096, true).unwrap();
            let mut page = pager.allocate(PageType::Data).unwrap();
            page.append_record(b"payload").unwrap();
            pager.write(&mut page).unwrap();
        }

        // Flip a byte in the record body.
        let mut raw = std::fs::read(&path).unwrap();
        raw[4000] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let verifying = Pager::open(&path, 4096, true).unwrap();
        assert!(matches!(
            verifying.read(0),
            Err(DbError::ChecksumMismatch { page_id: 0 })
        ));

        // Verification off: the read succeeds, recovery-style reads still
        // catch it.
        let lax = Pager::open(&path, 4096, false).unwrap();
        assert!(lax.read(0).is_ok());
        assert!(matches!(
            lax.read_with(0, true),
            Err(DbError::ChecksumMismatch { page_id: 0 })
        ));
    }
}
