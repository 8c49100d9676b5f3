//! Cache budget manager: global memory allowance and epoch-based job cancellation
//!
//! **Why**: Per-item caches share one memory budget. The manager tracks bytes
//! held by the [`GlobalFrameCache`](super::global_cache::GlobalFrameCache),
//! answers how many frames each cachable item may retain, and carries the
//! epoch used to skip queued caching jobs after a seek.

use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use sysinfo::System;

/// Global cache memory manager
#[derive(Debug)]
pub struct CacheManager {
    /// Atomically tracked memory usage (bytes)
    memory_usage: Arc<AtomicUsize>,
    /// Maximum allowed memory (bytes)
    max_memory_bytes: AtomicUsize,
    /// Epoch counter for cancelling stale caching requests
    current_epoch: Arc<AtomicU64>,
}

fn limit_from_system(mem_fraction: f64, reserve_gb: f64) -> (usize, usize) {
    let mut sys = System::new();
    sys.refresh_memory();

    let available = sys.available_memory() as usize;
    let reserve = (reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
    let usable = available.saturating_sub(reserve);
    (available, (usable as f64 * mem_fraction.clamp(0.0, 1.0)) as usize)
}

impl CacheManager {
    /// Create cache manager with a limit derived from available system memory
    ///
    /// * `mem_fraction` - Fraction of available memory (0.0-1.0)
    /// * `reserve_gb` - Memory kept free for the system (GB)
    pub fn new(mem_fraction: f64, reserve_gb: f64) -> Self {
        let (available, max_memory_bytes) = limit_from_system(mem_fraction, reserve_gb);

        info!(
            "CacheManager init: available={} MB, limit={} MB ({}%)",
            available / 1024 / 1024,
            max_memory_bytes / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );

        Self::with_limit(max_memory_bytes)
    }

    /// Create with an explicit byte limit
    pub fn with_limit(max_memory_bytes: usize) -> Self {
        Self {
            memory_usage: Arc::new(AtomicUsize::new(0)),
            max_memory_bytes: AtomicUsize::new(max_memory_bytes),
            current_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Increment epoch and return new value
    pub fn increment_epoch(&self) -> u64 {
        let new_epoch = self.current_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Epoch incremented: {}", new_epoch);
        new_epoch
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Shared epoch counter (for Workers)
    pub fn epoch_ref(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current_epoch)
    }

    /// True if usage is over the limit
    pub fn check_memory_limit(&self) -> bool {
        self.memory_usage.load(Ordering::Relaxed) > self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// Memory statistics (usage, limit)
    pub fn mem(&self) -> (usize, usize) {
        let usage = self.memory_usage.load(Ordering::Relaxed);
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        (usage, limit)
    }

    pub fn add_memory(&self, bytes: usize) {
        let new_usage = self.memory_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        if new_usage > limit {
            debug!(
                "Memory limit exceeded: {} MB / {} MB",
                new_usage / 1024 / 1024,
                limit / 1024 / 1024
            );
        }
    }

    /// Saturating release
    pub fn free_memory(&self, bytes: usize) {
        loop {
            let current = self.memory_usage.load(Ordering::Relaxed);
            let new_val = current.saturating_sub(bytes);
            if self
                .memory_usage
                .compare_exchange_weak(current, new_val, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// How many frames each cachable item may keep.
    ///
    /// The whole limit is split so that every item gets the same number of
    /// frames: `limit / sum(frame_sizes)`. Items with a zero frame size are
    /// ignored.
    pub fn frames_per_item(&self, frame_sizes: &[usize]) -> usize {
        let total: usize = frame_sizes.iter().sum();
        if total == 0 {
            return 0;
        }
        self.max_memory_bytes.load(Ordering::Relaxed) / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_manager_creation() {
        let manager = CacheManager::new(0.5, 1.0);
        assert_eq!(manager.current_epoch(), 0);
        let (usage, _limit) = manager.mem();
        assert_eq!(usage, 0);
    }

    #[test]
    fn test_epoch_increment() {
        let manager = CacheManager::with_limit(1024);
        assert_eq!(manager.increment_epoch(), 1);
        assert_eq!(manager.increment_epoch(), 2);
        assert_eq!(manager.current_epoch(), 2);
    }

    #[test]
    fn test_memory_tracking() {
        let manager = CacheManager::with_limit(1024 * 1024);
        manager.add_memory(1024 * 1024);
        assert!(!manager.check_memory_limit());
        manager.add_memory(1);
        assert!(manager.check_memory_limit());

        manager.free_memory(10 * 1024 * 1024);
        assert_eq!(manager.mem().0, 0);
    }

    #[test]
    fn test_frames_per_item() {
        let manager = CacheManager::with_limit(1000);
        assert_eq!(manager.frames_per_item(&[100, 100]), 5);
        assert_eq!(manager.frames_per_item(&[]), 0);
        assert_eq!(manager.frames_per_item(&[0]), 0);
    }
}
