// # Buffer Management
//
// The generic access-ordered LRU map and the page buffer manager built on
// it. The buffer manager owns every page copy in memory; callers pin pages
// they rely on and unpin them when done.

pub mod lru;
pub mod manager;

pub use lru::LruCache;
pub use manager::{BufferManager, BufferStats};
