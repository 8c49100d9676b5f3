//! Global frame cache with nested HashMap structure
//!
//! Structure: HashMap<ItemId, HashMap<i32, Frame>>
//! - Outer map: item id -> frames
//! - Inner map: frame_idx -> Frame
//!
//! Only complete frames are ever inserted, so a hit is always a valid frame.
//! Clearing one item is a single outer-key removal. Memory is reported to the
//! [`CacheManager`]; when it is over budget the least recently used frames are
//! evicted before a new one goes in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexSet;
use log::debug;

use super::cache_man::CacheManager;
use super::ids::ItemId;
use crate::entities::Frame;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

/// Entry in LRU eviction queue
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct CacheKey {
    item: ItemId,
    frame_idx: i32,
}

/// Global frame cache with nested HashMap + LRU eviction
#[derive(Debug)]
pub struct GlobalFrameCache {
    cache: Mutex<HashMap<ItemId, HashMap<i32, Frame>>>,
    /// LRU queue: front = oldest
    lru_order: Mutex<IndexSet<CacheKey>>,
    cache_manager: Arc<CacheManager>,
    stats: Arc<CacheStats>,
    /// Maximum entries (for eviction trigger)
    capacity: usize,
}

impl GlobalFrameCache {
    pub fn new(capacity: usize, manager: Arc<CacheManager>) -> Self {
        let capacity = capacity.max(1);
        debug!("GlobalFrameCache created: capacity={}", capacity);

        Self {
            cache: Mutex::new(HashMap::new()),
            lru_order: Mutex::new(IndexSet::with_capacity(capacity.min(4096))),
            cache_manager: manager,
            stats: Arc::new(CacheStats::default()),
            capacity,
        }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    /// Get frame from cache, refreshing its LRU position on hit
    pub fn get(&self, item: ItemId, frame_idx: i32) -> Option<Frame> {
        let result = {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(&item).and_then(|frames| frames.get(&frame_idx)).cloned()
        };

        if result.is_some() {
            self.stats.record_hit();
            let key = CacheKey { item, frame_idx };
            let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());
            lru.shift_remove(&key);
            lru.insert(key);
        } else {
            self.stats.record_miss();
        }

        result
    }

    /// Check presence without touching LRU order or stats
    pub fn contains(&self, item: ItemId, frame_idx: i32) -> bool {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(&item)
            .map(|frames| frames.contains_key(&frame_idx))
            .unwrap_or(false)
    }

    /// Insert unless already present. Returns true if the frame was inserted.
    ///
    /// Two threads racing on the same key both decode, but only the first
    /// insert wins; the cached frame never changes under a reader.
    pub fn insert_if_absent(&self, item: ItemId, frame_idx: i32, frame: Frame) -> bool {
        if self.contains(item, frame_idx) {
            return false;
        }
        self.evict_for_insert();

        let frame_size = frame.mem();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let frames = cache.entry(item).or_default();
        if frames.contains_key(&frame_idx) {
            return false;
        }
        let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());
        frames.insert(frame_idx, frame);
        lru.insert(CacheKey { item, frame_idx });
        self.cache_manager.add_memory(frame_size);

        debug!("Cached frame: {}:{} ({} bytes)", item, frame_idx, frame_size);
        true
    }

    fn evict_for_insert(&self) {
        while self.cache_manager.check_memory_limit() {
            if !self.evict_oldest() {
                break;
            }
        }
        while self.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// Evict oldest frame. Returns false if the cache is empty.
    fn evict_oldest(&self) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());

        let Some(key) = lru.shift_remove_index(0) else {
            return false;
        };

        if let Some(frames) = cache.get_mut(&key.item)
            && let Some(evicted) = frames.remove(&key.frame_idx)
        {
            self.cache_manager.free_memory(evicted.mem());
            if frames.is_empty() {
                cache.remove(&key.item);
            }
            debug!("LRU evicted: {}:{}", key.item, key.frame_idx);
            return true;
        }

        false
    }

    /// Remove one cached frame of an item
    pub fn clear_frame(&self, item: ItemId, frame_idx: i32) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());

        let Some(frames) = cache.get_mut(&item) else {
            return false;
        };
        let Some(frame) = frames.remove(&frame_idx) else {
            return false;
        };
        self.cache_manager.free_memory(frame.mem());
        if frames.is_empty() {
            cache.remove(&item);
        }
        lru.shift_remove(&CacheKey { item, frame_idx });
        debug!("Cleared single frame {}:{}", item, frame_idx);
        true
    }

    /// Remove every cached frame of an item
    pub fn clear_item(&self, item: ItemId) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(frames) = cache.remove(&item) {
            let mut total_freed = 0usize;
            for frame in frames.values() {
                let size = frame.mem();
                self.cache_manager.free_memory(size);
                total_freed += size;
            }
            lru.retain(|k| k.item != item);

            debug!(
                "Cleared item {}: {} frames, {} KB freed",
                item,
                frames.len(),
                total_freed / 1024
            );
        }
    }

    /// Sorted snapshot of cached frame indices for an item
    pub fn frames_of(&self, item: ItemId) -> Vec<i32> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<i32> = cache
            .get(&item)
            .map(|frames| frames.keys().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Total number of cached frames
    pub fn len(&self) -> usize {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.values().map(|frames| frames.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    pub fn item_frame_count(&self, item: ItemId) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&item)
            .map(|frames| frames.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(width: usize, height: usize) -> Frame {
        Frame::solid(width, height, [0, 0, 0, 255])
    }

    fn make_cache(capacity: usize, limit: usize) -> GlobalFrameCache {
        GlobalFrameCache::new(capacity, Arc::new(CacheManager::with_limit(limit)))
    }

    #[test]
    fn test_cache_basic_operations() {
        let cache = make_cache(100, usize::MAX / 2);
        let item = ItemId(1);

        cache.insert_if_absent(item, 0, make_frame(64, 64));
        assert!(cache.contains(item, 0));
        assert!(cache.get(item, 0).is_some());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.item_frame_count(item), 1);
    }

    #[test]
    fn test_insert_if_absent_is_idempotent() {
        let cache = make_cache(100, usize::MAX / 2);
        let item = ItemId(3);

        assert!(cache.insert_if_absent(item, 5, make_frame(4, 4)));
        assert!(!cache.insert_if_absent(item, 5, make_frame(8, 8)));
        assert_eq!(cache.get(item, 5).map(|f| f.width()), Some(4));
        assert_eq!(cache.manager().mem().0, 4 * 4 * 4);
    }

    #[test]
    fn test_cache_clear_item() {
        let cache = make_cache(1000, usize::MAX / 2);
        let a = ItemId(1);
        let b = ItemId(2);
        let frame = make_frame(8, 8);

        for i in 0..100 {
            cache.insert_if_absent(a, i, frame.clone());
        }
        cache.insert_if_absent(b, 0, frame.clone());

        cache.clear_item(a);
        assert_eq!(cache.item_frame_count(a), 0);
        assert!(!cache.contains(a, 50));
        assert!(cache.contains(b, 0));
        assert_eq!(cache.manager().mem().0, frame.mem());
    }

    #[test]
    fn test_clear_frame_and_snapshot() {
        let cache = make_cache(100, usize::MAX / 2);
        let item = ItemId(9);
        for i in [4, 1, 3] {
            cache.insert_if_absent(item, i, make_frame(2, 2));
        }
        assert_eq!(cache.frames_of(item), vec![1, 3, 4]);
        assert!(cache.clear_frame(item, 3));
        assert!(!cache.clear_frame(item, 3));
        assert_eq!(cache.frames_of(item), vec![1, 4]);
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let cache = make_cache(2, usize::MAX / 2);
        let item = ItemId(1);
        cache.insert_if_absent(item, 0, make_frame(2, 2));
        cache.insert_if_absent(item, 1, make_frame(2, 2));
        // Touch 0 so 1 becomes the oldest
        let _ = cache.get(item, 0);
        cache.insert_if_absent(item, 2, make_frame(2, 2));

        assert!(cache.contains(item, 0));
        assert!(!cache.contains(item, 1));
        assert!(cache.contains(item, 2));
    }

    #[test]
    fn test_memory_limit_evicts() {
        let frame = make_frame(4, 4);
        let cache = make_cache(100, frame.mem() * 2);
        let item = ItemId(1);
        for i in 0..5 {
            cache.insert_if_absent(item, i, frame.clone());
        }
        let (usage, _) = cache.manager().mem();
        assert!(usage <= frame.mem() * 3);
        assert!(cache.contains(item, 4));
        assert!(!cache.contains(item, 0));
    }

    #[test]
    fn test_cache_statistics() {
        let cache = make_cache(100, usize::MAX / 2);
        let item = ItemId(1);
        let stats = cache.stats();

        cache.insert_if_absent(item, 0, make_frame(2, 2));
        let _ = cache.get(item, 0);
        let _ = cache.get(item, 999);
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }
}
