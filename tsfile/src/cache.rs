//! The in-memory page store.
//!
//! A mapping from page id to page plus a secondary mapping from tag to the
//! current writable page for that tag. Each page carries the generation it
//! was allocated under; once the store grows past the high watermark, clean
//! pages whose generation is older than `current - low_watermark` are
//! evicted. Dirty, full-but-uncommitted and writable pages never evict.
//!
//! The cache itself carries no lock: it lives inside the file state behind
//! the file-level read-write lock.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::page::Page;

/// Cache size that triggers an eviction sweep.
pub const HIGH_WATERMARK: usize = 64;

/// Generation distance a clean page must fall behind to be evicted.
pub const LOW_WATERMARK: u64 = 32;

pub struct PageCache {
    pages: HashMap<u32, Arc<Page>>,
    writable: HashMap<u16, u32>,
    generation: u64,
    high_watermark: usize,
    low_watermark: u64,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            writable: HashMap::new(),
            generation: 0,
            high_watermark: HIGH_WATERMARK,
            low_watermark: LOW_WATERMARK,
        }
    }

    /// Next allocation generation.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn get(&self, id: u32) -> Option<Arc<Page>> {
        self.pages.get(&id).cloned()
    }

    pub fn insert(&mut self, page: Arc<Page>) {
        self.pages.insert(page.id, page);
    }

    /// The current writable page for `tag`, if any.
    pub fn writable_for(&self, tag: u16) -> Option<Arc<Page>> {
        self.writable
            .get(&tag)
            .and_then(|id| self.pages.get(id))
            .cloned()
    }

    pub fn set_writable(&mut self, tag: u16, id: u32) {
        self.writable.insert(tag, id);
    }

    /// Drop the writable marker if it still points at `id`.
    pub fn clear_writable(&mut self, tag: u16, id: u32) {
        if self.writable.get(&tag) == Some(&id) {
            self.writable.remove(&tag);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> impl Iterator<Item = &Arc<Page>> {
        self.pages.values()
    }

    /// Generation-based sweep; returns how many pages were dropped.
    pub fn evict(&mut self) -> usize {
        if self.pages.len() <= self.high_watermark {
            return 0;
        }
        let cutoff = self.generation.saturating_sub(self.low_watermark);
        let writable: Vec<u32> = self.writable.values().copied().collect();
        let before = self.pages.len();
        self.pages.retain(|id, page| {
            page.is_dirty()
                || page.is_full()
                || writable.contains(id)
                || page.generation >= cutoff
        });
        let evicted = before - self.pages.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.pages.len(), "evicted cold pages");
        }
        evicted
    }

    /// Drop committed full pages after a commit pass.
    pub fn evict_committed(&mut self) -> usize {
        let before = self.pages.len();
        self.pages.retain(|_, page| !(page.is_full() && !page.is_dirty()));
        // Full pages are never writable, but stale markers cost nothing to drop.
        let live: Vec<u16> = self
            .writable
            .iter()
            .filter(|(_, id)| !self.pages.contains_key(id))
            .map(|(tag, _)| *tag)
            .collect();
        for tag in live {
            self.writable.remove(&tag);
        }
        before - self.pages.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_pages: self.pages.len(),
            generation: self.generation,
            high_watermark: self.high_watermark,
            low_watermark: self.low_watermark,
        }
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cached_pages: usize,
    pub generation: u64,
    pub high_watermark: usize,
    pub low_watermark: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: u32, generation: u64) -> Arc<Page> {
        Arc::new(Page::for_entries(id, 32, generation, 16, 4))
    }

    #[test]
    fn test_eviction_respects_watermarks() {
        let mut cache = PageCache::new();
        for i in 0..HIGH_WATERMARK as u32 + 10 {
            let generation = cache.next_generation();
            cache.insert(page(i, generation));
        }
        let evicted = cache.evict();
        assert!(evicted > 0);
        // Recent generations survive.
        let cutoff = cache.stats().generation - LOW_WATERMARK;
        assert!(cache.pages().all(|p| p.generation >= cutoff));
    }

    #[test]
    fn test_dirty_pages_bypass_eviction() {
        let mut cache = PageCache::new();
        for i in 0..HIGH_WATERMARK as u32 + 10 {
            let generation = cache.next_generation();
            let p = page(i, generation);
            p.append(&[0u8; 4]); // dirty
            cache.insert(p);
        }
        assert_eq!(cache.evict(), 0);
    }

    #[test]
    fn test_writable_tracking() {
        let mut cache = PageCache::new();
        let p = page(7, 1);
        cache.insert(p);
        cache.set_writable(32, 7);
        assert_eq!(cache.writable_for(32).unwrap().id, 7);

        cache.clear_writable(32, 3); // wrong id, no-op
        assert!(cache.writable_for(32).is_some());
        cache.clear_writable(32, 7);
        assert!(cache.writable_for(32).is_none());
    }

    #[test]
    fn test_evict_committed_drops_clean_full_pages() {
        let mut cache = PageCache::new();
        let p = page(1, 1);
        p.append(&[0u8; 16]); // fills capacity 4
        assert!(p.is_full());
        p.mark_clean();
        cache.insert(p);
        cache.insert(page(2, 2));

        assert_eq!(cache.evict_committed(), 1);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }
}
