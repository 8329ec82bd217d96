// # Buffer Manager
//
// Page cache over the pager with pin counting and dirty tracking. One
// internal mutex protects the descriptor map and its recency order and is
// held across the page I/O under each operation, so pin, flush and eviction
// decisions always see a consistent cache state.
//
// Eviction policy: on a miss when the pool is full, unpinned descriptors
// are scanned in LRU order; dirty ones are written through the pager before
// removal. When every descriptor is pinned the fetch fails with
// `BufferExhausted`.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::buffer::lru::LruCache;
use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::pager::Pager;

/// Cached page plus bookkeeping.
#[derive(Debug)]
struct PageDescriptor {
    page: Page,
    pin_count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub fetches: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl BufferStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.fetches == 0 {
            return 0.0;
        }
        self.hits as f64 / self.fetches as f64
    }
}

pub struct BufferManager {
    pager: Arc<Pager>,
    capacity: usize,
    // The inner LruCache is unbounded; capacity is enforced here so a scan
    // can skip pinned descriptors instead of evicting blindly.
    cache: Mutex<LruCache<PageId, PageDescriptor>>,
    stats: RwLock<BufferStats>,
}

impl BufferManager {
    pub fn new(pager: Arc<Pager>, capacity: usize) -> Self {
        assert!(capacity >= 1, "buffer pool needs at least one frame");
        Self {
            pager,
            capacity,
            cache: Mutex::new(LruCache::new(usize::MAX)),
            stats: RwLock::new(BufferStats::default()),
        }
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    pub fn stats(&self) -> BufferStats {
        *self.stats.read()
    }

    /// Make room for one more descriptor. Scans unpinned pages LRU-first,
    /// flushing dirty ones before removal.
    fn ensure_capacity(&self, cache: &mut LruCache<PageId, PageDescriptor>) -> Result<()> {
        while cache.len() >= self.capacity {
            let victims = cache.keys_where(|_, d| d.pin_count == 0);
            let victim = match victims.first() {
                Some(&id) => id,
                None => {
                    return Err(DbError::BufferExhausted {
                        capacity: self.capacity,
                    })
                }
            };
            if let Some(desc) = cache.peek_mut(&victim) {
                if desc.page.is_dirty() {
                    self.pager.write(&mut desc.page)?;
                    self.stats.write().writes += 1;
                }
            }
            cache.remove(&victim);
            debug!(page_id = victim, "evicted page");
        }
        Ok(())
    }

    /// Load a page into the cache (pinned) and return a guard-free handle
    /// to its descriptor by running `f` under the lock.
    fn with_descriptor<R>(
        &self,
        page_id: PageId,
        pin: bool,
        f: impl FnOnce(&mut PageDescriptor) -> R,
    ) -> Result<R> {
        let mut cache = self.cache.lock();
        let mut stats_hit = true;

        if !cache.contains(&page_id) {
            stats_hit = false;
            self.ensure_capacity(&mut cache)?;
            let page = self.pager.read(page_id)?;
            cache.put(
                page_id,
                PageDescriptor {
                    page,
                    pin_count: 0,
                },
            );
        }

        {
            let mut stats = self.stats.write();
            stats.fetches += 1;
            if stats_hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }

        let desc = cache
            .get_mut(&page_id)
            .expect("descriptor inserted above");
        if pin {
            desc.pin_count += 1;
        }
        Ok(f(desc))
    }

    /// Pin a page and return a copy of it. The caller owns the copy; the
    /// pin keeps the cached original resident until `unpin`.
    pub fn fetch(&self, page_id: PageId) -> Result<Page> {
        self.with_descriptor(page_id, true, |d| d.page.clone())
    }

    /// Copy a page out without pinning. A cached page is served as-is; a
    /// miss reads through the pager without populating the cache.
    pub fn peek(&self, page_id: PageId) -> Result<Page> {
        let cache = self.cache.lock();
        if let Some(desc) = cache.peek(&page_id) {
            return Ok(desc.page.clone());
        }
        drop(cache);
        self.pager.read(page_id)
    }

    /// Allocate a fresh page through the pager; it enters the cache pinned
    /// and dirty.
    pub fn allocate(&self, page_type: PageType) -> Result<Page> {
        let mut cache = self.cache.lock();
        self.ensure_capacity(&mut cache)?;
        let page = self.pager.allocate(page_type)?;
        let id = page.id();
        cache.put(
            id,
            PageDescriptor {
                page: page.clone(),
                pin_count: 1,
            },
        );
        Ok(page)
    }

    /// Run a closure against the cached page, marking it dirty. The page is
    /// pinned for the duration of the closure.
    pub fn with_page_mut<R>(&self, page_id: PageId, f: impl FnOnce(&mut Page) -> R) -> Result<R> {
        self.with_descriptor(page_id, false, |d| {
            let r = f(&mut d.page);
            d.page.mark_dirty();
            r
        })
    }

    /// Run a closure against the cached page, read-only.
    pub fn with_page<R>(&self, page_id: PageId, f: impl FnOnce(&Page) -> R) -> Result<R> {
        self.with_descriptor(page_id, false, |d| f(&d.page))
    }

    pub fn pin(&self, page_id: PageId) -> Result<()> {
        self.with_descriptor(page_id, true, |_| ())
    }

    /// Drop one pin. Unpinning a page that is not pinned is a usage error.
    pub fn unpin(&self, page_id: PageId) -> Result<()> {
        let mut cache = self.cache.lock();
        let desc = cache
            .peek_mut(&page_id)
            .ok_or_else(|| DbError::NotFound(format!("page {page_id} not cached")))?;
        if desc.pin_count == 0 {
            return Err(DbError::InvalidOperation(format!(
                "unpin of unpinned page {page_id}"
            )));
        }
        desc.pin_count -= 1;
        Ok(())
    }

    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.cache.lock().peek(&page_id).map(|d| d.pin_count)
    }

    pub fn mark_dirty(&self, page_id: PageId) -> Result<()> {
        let mut cache = self.cache.lock();
        let desc = cache
            .peek_mut(&page_id)
            .ok_or_else(|| DbError::NotFound(format!("page {page_id} not cached")))?;
        desc.page.mark_dirty();
        Ok(())
    }

    /// Write one page through the pager if it is dirty.
    pub fn flush(&self, page_id: PageId) -> Result<()> {
        let mut cache = self.cache.lock();
        if let Some(desc) = cache.peek_mut(&page_id) {
            if desc.page.is_dirty() {
                self.pager.write(&mut desc.page)?;
                self.stats.write().writes += 1;
            }
        }
        Ok(())
    }

    /// Write every dirty page through the pager, then fsync the file.
    pub fn flush_all(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        let dirty = cache.keys_where(|_, d| d.page.is_dirty());
        for id in dirty {
            if let Some(desc) = cache.peek_mut(&id) {
                self.pager.write(&mut desc.page)?;
                self.stats.write().writes += 1;
            }
        }
        self.pager.flush()
    }

    /// Flush-if-dirty and drop a page from the cache. Pinned pages refuse.
    pub fn evict(&self, page_id: PageId) -> Result<()> {
        let mut cache = self.cache.lock();
        match cache.peek_mut(&page_id) {
            None => Ok(()),
            Some(desc) => {
                if desc.pin_count > 0 {
                    return Err(DbError::PinnedPage(page_id));
                }
                if desc.page.is_dirty() {
                    self.pager.write(&mut desc.page)?;
                    self.stats.write().writes += 1;
                }
                cache.remove(&page_id);
                Ok(())
            }
        }
    }

    /// Warm the cache with pages that are not yet resident, unpinned.
    pub fn prefetch(&self, page_ids: &[PageId]) -> Result<()> {
        let mut cache = self.cache.lock();
        for &id in page_ids {
            if cache.contains(&id) {
                continue;
            }
            if cache.len() >= self.capacity {
                break;
            }
            let page = self.pager.read(id)?;
            cache.put(
                id,
                PageDescriptor {
                    page,
                    pin_count: 0,
                },
            );
        }
        Ok(())
    }

    /// Flush everything and empty the cache. Fails if any page is pinned.
    pub fn clear(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        if let Some(pinned) = cache.keys_where(|_, d| d.pin_count > 0).first() {
            return Err(DbError::PinnedPage(*pinned));
        }
        let dirty = cache.keys_where(|_, d| d.page.is_dirty());
        for id in dirty {
            if let Some(desc) = cache.peek_mut(&id) {
                self.pager.write(&mut desc.page)?;
                self.stats.write().writes += 1;
            }
        }
        cache.clear();
        Ok(())
    }

    /// Flush, clear and release the underlying file. Flush failures are
    /// reported as warnings; close still completes.
    pub fn close(&self) -> Result<()> {
        if let Err(e) = self.flush_all() {
            warn!(error = %e, "flush during close failed");
        }
        if let Err(e) = self.clear() {
            warn!(error = %e, "clear during close failed");
        }
        self.pager.close()
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
