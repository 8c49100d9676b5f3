//! Shared child bookkeeping of container items.
//!
//! Structural edits (insert, remove, move) only touch the list and set the
//! stale bit. The owning item clears it in `resync()`, which every
//! composition entry point calls first, after rebuilding whatever it derives
//! from the children.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use super::item::{Item, ItemError, NO_RANGE};
use crate::core::ids::ItemId;

/// How a container combines its children's frame limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitsMode {
    /// Frames every indexed child has
    Intersection,
    /// Frames any indexed child has
    Union,
}

pub struct ContainerBase {
    children: RwLock<Vec<Arc<dyn Item>>>,
    max_count: Option<usize>,
    stale: AtomicBool,
    mode: LimitsMode,
}

impl std::fmt::Debug for ContainerBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerBase")
            .field("children", &self.child_ids())
            .field("max_count", &self.max_count)
            .field("stale", &self.is_stale())
            .finish()
    }
}

impl ContainerBase {
    pub fn new(max_count: Option<usize>, mode: LimitsMode) -> Self {
        Self {
            children: RwLock::new(Vec::new()),
            max_count,
            stale: AtomicBool::new(false),
            mode,
        }
    }

    pub fn max_count(&self) -> Option<usize> {
        self.max_count
    }

    pub fn children(&self) -> Vec<Arc<dyn Item>> {
        self.children.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn child_ids(&self) -> Vec<ItemId> {
        self.children
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|c| c.id())
            .collect()
    }

    pub fn child(&self, index: usize) -> Option<Arc<dyn Item>> {
        self.children
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.children.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.max_count.is_some_and(|max| self.len() >= max)
    }

    /// Insert at `index` (append if None or past the end)
    pub fn insert(&self, index: Option<usize>, child: Arc<dyn Item>) -> Result<(), ItemError> {
        let mut children = self.children.write().unwrap_or_else(|e| e.into_inner());
        if let Some(max) = self.max_count
            && children.len() >= max
        {
            return Err(ItemError::ContainerFull { max });
        }
        let at = index.unwrap_or(children.len()).min(children.len());
        debug!("Container: insert {} at {}", child.id(), at);
        children.insert(at, child);
        self.stale.store(true, Ordering::Release);
        Ok(())
    }

    pub fn remove(&self, id: ItemId) -> Option<Arc<dyn Item>> {
        let mut children = self.children.write().unwrap_or_else(|e| e.into_inner());
        let pos = children.iter().position(|c| c.id() == id)?;
        let removed = children.remove(pos);
        self.stale.store(true, Ordering::Release);
        Some(removed)
    }

    /// Reorder: move child `from` to position `to`
    pub fn move_child(&self, from: usize, to: usize) -> bool {
        let mut children = self.children.write().unwrap_or_else(|e| e.into_inner());
        if from >= children.len() || to >= children.len() {
            return false;
        }
        if from != to {
            let c = children.remove(from);
            children.insert(to, c);
            self.stale.store(true, Ordering::Release);
        }
        true
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Clear the stale bit, returning whether it was set
    pub fn take_stale(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }

    /// Merge the ranges of the indexed children
    pub fn merged_limits(&self) -> (i32, i32) {
        let children = self.children.read().unwrap_or_else(|e| e.into_inner());
        let mut merged: Option<(i32, i32)> = None;
        for c in children.iter().filter(|c| c.is_indexed()) {
            let r = c.frame_range();
            merged = Some(match (merged, self.mode) {
                (None, _) => r,
                (Some(m), LimitsMode::Union) => {
                    if r == NO_RANGE {
                        m
                    } else if m == NO_RANGE {
                        r
                    } else {
                        (m.0.min(r.0), m.1.max(r.1))
                    }
                }
                (Some(m), LimitsMode::Intersection) => {
                    if m == NO_RANGE || r == NO_RANGE {
                        NO_RANGE
                    } else {
                        let (a, b) = (m.0.max(r.0), m.1.min(r.1));
                        if a > b { NO_RANGE } else { (a, b) }
                    }
                }
            });
        }
        merged.unwrap_or(NO_RANGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::geometry::Size;
    use crate::entities::item::ItemEnv;
    use crate::entities::sources::PatternSource;
    use crate::entities::{TextItem, VideoItem};

    fn video(env: &ItemEnv, frames: i32) -> Arc<dyn Item> {
        Arc::new(VideoItem::new(env, "v", Arc::new(PatternSource::new(Size::new(2, 2), frames, 0))))
    }

    #[test]
    fn test_bounded_insert() {
        let env = ItemEnv::for_tests();
        let c = ContainerBase::new(Some(2), LimitsMode::Intersection);
        c.insert(None, video(&env, 5)).unwrap();
        c.insert(Some(0), video(&env, 5)).unwrap();
        assert!(c.is_full());
        assert_eq!(c.insert(None, video(&env, 5)), Err(ItemError::ContainerFull { max: 2 }));
        assert!(c.take_stale());
        assert!(!c.take_stale());
    }

    #[test]
    fn test_merged_limits() {
        let env = ItemEnv::for_tests();
        let union = ContainerBase::new(None, LimitsMode::Union);
        assert_eq!(union.merged_limits(), NO_RANGE);
        union.insert(None, Arc::new(TextItem::new(&env, "static"))).unwrap();
        assert_eq!(union.merged_limits(), NO_RANGE);
        union.insert(None, video(&env, 10)).unwrap();
        union.insert(None, video(&env, 30)).unwrap();
        assert_eq!(union.merged_limits(), (0, 29));

        let inter = ContainerBase::new(Some(2), LimitsMode::Intersection);
        inter.insert(None, video(&env, 10)).unwrap();
        inter.insert(None, video(&env, 30)).unwrap();
        assert_eq!(inter.merged_limits(), (0, 9));
    }

    #[test]
    fn test_remove_and_move() {
        let env = ItemEnv::for_tests();
        let c = ContainerBase::new(None, LimitsMode::Union);
        let a = video(&env, 1);
        let b = video(&env, 1);
        c.insert(None, Arc::clone(&a)).unwrap();
        c.insert(None, Arc::clone(&b)).unwrap();
        c.take_stale();

        assert!(c.move_child(1, 0));
        assert_eq!(c.child_ids(), vec![b.id(), a.id()]);
        assert!(c.take_stale());
        assert!(c.remove(a.id()).is_some());
        assert!(c.remove(a.id()).is_none());
        assert_eq!(c.len(), 1);
    }
}
