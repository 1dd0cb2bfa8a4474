use vram_model::Rect;

use crate::HdTextureHandle;

const CACHE_ENTRIES: usize = 4;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    rect: Rect,
    handle: HdTextureHandle,
}

/// Most-recently-used lookups, front first. Only holds single-rect handles, so an entry
/// is valid exactly as long as its tracked rect stays alive.
#[derive(Debug, Default)]
pub(crate) struct HandleLruCache {
    entries: Vec<CacheEntry>,
    pub hits: u64,
    pub misses: u64,
}

impl HandleLruCache {
    pub fn get(&mut self, rect: &Rect, palette_hash: u32) -> Option<HdTextureHandle> {
        let Some(position) = self.entries.iter().position(|entry| {
            entry.handle.palette_hash() == Some(palette_hash) && entry.rect.contains(rect)
        }) else {
            self.misses += 1;
            return None;
        };
        let entry = self.entries.remove(position);
        self.entries.insert(0, entry);
        self.hits += 1;
        Some(entry.handle)
    }

    pub fn insert(&mut self, rect: Rect, handle: HdTextureHandle) {
        if self.entries.len() >= CACHE_ENTRIES {
            self.entries.pop();
        }
        self.entries.insert(0, CacheEntry { rect, handle });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Hit ratio since the last reset, `None` before any lookup.
    pub fn take_hit_ratio(&mut self) -> Option<f64> {
        let total = self.hits + self.misses;
        let ratio = (total != 0).then(|| self.hits as f64 / total as f64);
        self.hits = 0;
        self.misses = 0;
        ratio
    }
}
