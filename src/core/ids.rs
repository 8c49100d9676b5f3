//! Item identity: process-unique ids handed out by an explicit allocator.
//!
//! The allocator is owned by the [`Playlist`](crate::entities::Playlist) and
//! shared with item constructors through [`ItemEnv`](crate::entities::ItemEnv),
//! so construction order is visible and tests can create isolated trees.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Unique (per allocator) item identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id. Never returns the same id twice.
    pub fn allocate(&self) -> ItemId {
        ItemId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_monotonic() {
        let ids = IdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();
        assert!(b > a);
        assert_eq!(ids.allocate(), ItemId(2));
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let ids = Arc::new(IdAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..100).map(|_| ids.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<ItemId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
