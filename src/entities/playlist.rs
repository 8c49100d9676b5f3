//! Playlist - owner of the item tree and its shared services.
//!
//! The playlist is the coordinating-thread side of the engine:
//! - structural edits (add, move, remove) with cycle and capacity checks
//! - change propagation: drains item signals, lets every ancestor resync
//!   (nearest first), then publishes to the [`EventBus`]
//! - source polling and reloading
//! - background load scheduling and the caching pass
//!
//! Without a worker pool every load runs inline, which keeps tests
//! deterministic.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, trace};

use super::item::{CacheIndex, Item, ItemEnv, ItemError, NO_RANGE, item_and_all_children};
use crate::config::EngineConfig;
use crate::core::event_bus::{
    DoubleBufferLoadedEvent, EventBus, ItemCacheClearedEvent, ItemChangedEvent,
};
use crate::core::ids::ItemId;
use crate::core::signals::SignalKind;
use crate::core::workers::Workers;

pub struct Playlist {
    env: ItemEnv,
    roots: Vec<Arc<dyn Item>>,
    bus: EventBus,
    workers: Option<Workers>,
    /// Items with a queued or running load job
    pending_loads: Arc<Mutex<HashSet<ItemId>>>,
    selected: Option<ItemId>,
}

impl std::fmt::Debug for Playlist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playlist")
            .field("roots", &self.roots)
            .field("workers", &self.workers)
            .field("selected", &self.selected)
            .finish()
    }
}

impl Playlist {
    /// Playlist with a background worker pool sized from `config`
    pub fn new(config: EngineConfig) -> Self {
        let threads = config.worker_threads();
        let env = ItemEnv::new(config);
        let workers = Workers::new(threads, env.cache.manager().epoch_ref());
        Self::with_env(env, Some(workers))
    }

    pub fn with_env(env: ItemEnv, workers: Option<Workers>) -> Self {
        info!(
            "Playlist created ({} workers)",
            workers.as_ref().map(|w| w.threads()).unwrap_or(0)
        );
        Self {
            env,
            roots: Vec::new(),
            bus: EventBus::new(),
            workers,
            pending_loads: Arc::new(Mutex::new(HashSet::new())),
            selected: None,
        }
    }

    /// Inline loading, small fixed cache
    pub fn for_tests() -> Self {
        Self::with_env(ItemEnv::for_tests(), None)
    }

    pub fn env(&self) -> &ItemEnv {
        &self.env
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn workers(&self) -> Option<&Workers> {
        self.workers.as_ref()
    }

    pub fn roots(&self) -> &[Arc<dyn Item>] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn selected(&self) -> Option<Arc<dyn Item>> {
        self.selected.and_then(|id| self.find(id))
    }

    pub fn set_selected(&mut self, id: Option<ItemId>) {
        self.selected = id.filter(|id| self.find(*id).is_some());
    }

    /// Every item in pre-order
    pub fn all_items(&self) -> Vec<Arc<dyn Item>> {
        self.roots.iter().flat_map(item_and_all_children).collect()
    }

    pub fn find(&self, id: ItemId) -> Option<Arc<dyn Item>> {
        self.path_to(id).and_then(|mut p| p.pop())
    }

    /// Items from the root down to `id`, inclusive
    pub fn path_to(&self, id: ItemId) -> Option<Vec<Arc<dyn Item>>> {
        fn walk(item: &Arc<dyn Item>, id: ItemId, path: &mut Vec<Arc<dyn Item>>) -> bool {
            path.push(Arc::clone(item));
            if item.id() == id {
                return true;
            }
            for child in item.children() {
                if walk(&child, id, path) {
                    return true;
                }
            }
            path.pop();
            false
        }

        let mut path = Vec::new();
        self.roots
            .iter()
            .any(|r| walk(r, id, &mut path))
            .then_some(path)
    }

    pub fn parent_of(&self, id: ItemId) -> Option<Arc<dyn Item>> {
        let mut path = self.path_to(id)?;
        path.pop();
        path.pop()
    }

    // ------------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------------

    pub fn add_root(&mut self, item: Arc<dyn Item>) -> ItemId {
        let id = item.id();
        debug!("Playlist: add root {:?}", item);
        item.on_added();
        self.roots.push(item);
        id
    }

    /// Append `child` to container `parent`. A child already in the tree is
    /// moved.
    pub fn add_child(&mut self, parent: ItemId, child: Arc<dyn Item>) -> Result<(), ItemError> {
        let parent_item = self.find(parent).ok_or(ItemError::UnknownItem(parent))?;
        let Some(container) = parent_item.container() else {
            return Err(ItemError::NotAContainer(parent));
        };
        if item_and_all_children(&child).iter().any(|i| i.id() == parent) {
            return Err(ItemError::CycleRejected);
        }
        if !parent_item.accepts_child(child.as_ref()) {
            return Err(match container.max_count() {
                Some(max) if container.is_full() => ItemError::ContainerFull { max },
                _ => ItemError::ChildRejected { parent, child: child.id() },
            });
        }

        self.detach(child.id());
        container.insert(None, Arc::clone(&child))?;
        child.on_added();
        debug!("Playlist: {:?} -> {:?}", child, parent_item);
        parent_item.resync();
        parent_item.base().signals().changed(true);
        Ok(())
    }

    /// Reorder the children of `parent`. Returns false if either position is
    /// out of bounds.
    pub fn move_child(
        &mut self,
        parent: ItemId,
        from: usize,
        to: usize,
    ) -> Result<bool, ItemError> {
        let parent_item = self.find(parent).ok_or(ItemError::UnknownItem(parent))?;
        let container = parent_item.container().ok_or(ItemError::NotAContainer(parent))?;
        if !container.move_child(from, to) {
            return Ok(false);
        }
        if from != to {
            parent_item.resync();
            parent_item.base().signals().changed(true);
        }
        Ok(true)
    }

    /// Take `id` out of the tree without invalidating it
    fn detach(&mut self, id: ItemId) -> Option<Arc<dyn Item>> {
        if let Some(pos) = self.roots.iter().position(|r| r.id() == id) {
            return Some(self.roots.remove(pos));
        }
        let parent = self.parent_of(id)?;
        let removed = parent.container()?.remove(id)?;
        parent.resync();
        parent.base().signals().changed(true);
        Some(removed)
    }

    /// Remove `id` and its subtree. Children are notified first and every
    /// cached frame under the subtree is dropped. Queued caching jobs are
    /// cancelled; the next caching pass schedules the survivors again.
    pub fn remove(&mut self, id: ItemId) -> Result<Arc<dyn Item>, ItemError> {
        let removed = self.detach(id).ok_or(ItemError::UnknownItem(id))?;
        self.cancel_caching();
        removed.on_removed();
        if self
            .selected
            .is_some_and(|sel| item_and_all_children(&removed).iter().any(|i| i.id() == sel))
        {
            self.selected = None;
        }
        info!("Playlist: removed {:?}", removed);
        Ok(removed)
    }

    pub fn clear(&mut self) {
        self.cancel_caching();
        for root in std::mem::take(&mut self.roots) {
            root.on_removed();
        }
        self.selected = None;
    }

    // ------------------------------------------------------------------------
    // Change propagation
    // ------------------------------------------------------------------------

    /// Drain item signals. Ancestors of the source see the event nearest
    /// first, then it is published on the bus. Returns the number handled.
    pub fn process_events(&self) -> usize {
        let events = self.env.hub.drain();
        let mut handled = 0;
        for ev in events {
            let Some(path) = self.path_to(ev.source) else {
                trace!("Playlist: dropping {:?} from detached item", ev);
                continue;
            };
            for ancestor in path[..path.len() - 1].iter().rev() {
                ancestor.child_changed(ev.source, ev.kind);
            }
            let root = path[0].id();
            match ev.kind {
                SignalKind::Changed { redraw } => self.bus.emit(ItemChangedEvent {
                    source: ev.source,
                    root,
                    redraw,
                }),
                SignalKind::CacheCleared { redraw } => self.bus.emit(ItemCacheClearedEvent {
                    source: ev.source,
                    root,
                    redraw,
                }),
                SignalKind::DoubleBufferLoaded { frame } => {
                    self.bus.emit(DoubleBufferLoadedEvent { source: ev.source, frame })
                }
            }
            handled += 1;
        }
        handled
    }

    /// Reload every item whose source reports a change. Queued caching jobs
    /// are cancelled first so none of them reads the old data.
    pub fn poll_source_changes(&self) -> Vec<ItemId> {
        let changed: Vec<_> = self
            .all_items()
            .into_iter()
            .filter(|item| item.is_source_changed())
            .collect();
        if changed.is_empty() {
            return Vec::new();
        }
        self.cancel_caching();
        changed
            .iter()
            .map(|item| {
                info!("Playlist: source of {:?} changed, reloading", item);
                item.reload_item_source();
                item.id()
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Run `load_frame` for `item`, on a worker when there is a pool. At most
    /// one job per item is queued. Returns false if one already was.
    pub fn schedule_load(&self, item: &Arc<dyn Item>, frame: i32, playback: bool) -> bool {
        let Some(workers) = &self.workers else {
            item.load_frame(frame, playback, false);
            return true;
        };

        let id = item.id();
        if !self.pending_loads.lock().unwrap_or_else(|e| e.into_inner()).insert(id) {
            trace!("Playlist: load of {} frame {} already queued", id, frame);
            return false;
        }
        let item = Arc::clone(item);
        let pending = Arc::clone(&self.pending_loads);
        workers.execute(move || {
            item.load_frame(frame, playback, false);
            pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        });
        true
    }

    /// Wait for queued jobs. Always true without a pool.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.workers.as_ref().is_none_or(|w| w.wait_idle(timeout))
    }

    // ------------------------------------------------------------------------
    // Caching
    // ------------------------------------------------------------------------

    pub fn set_caching_enabled(&self, enabled: bool) {
        for item in self.all_items() {
            item.set_caching_enabled(enabled);
        }
    }

    /// Make queued caching jobs stale (e.g. after a seek)
    pub fn cancel_caching(&self) -> u64 {
        self.env.cache.manager().increment_epoch()
    }

    /// Cache the window starting at `center` for every cachable item and drop
    /// cached frames outside it. The window length is the memory budget
    /// divided by the combined frame size. Returns the number of frames
    /// scheduled for caching.
    pub fn update_caching(&self, center: i32) -> usize {
        let items: Vec<_> = self.all_items().into_iter().filter(|i| i.is_cachable()).collect();
        let sizes: Vec<usize> = items.iter().map(|i| i.caching_frame_size()).collect();
        let manager = self.env.cache.manager();
        let budget = manager.frames_per_item(&sizes) as i64;
        let epoch = manager.current_epoch();
        debug!("Playlist: caching pass at {} ({} items, {} frames each)", center, items.len(), budget);

        let mut scheduled = 0;
        for item in items {
            let (start, end) = item.frame_range();
            if (start, end) == NO_RANGE {
                continue;
            }
            let first = center.clamp(start, end);
            let last = (first as i64 + budget - 1).min(end as i64) as i32;
            let window = first..=last;

            for f in item.cached_frames() {
                if budget == 0 || !window.contains(&f) {
                    item.remove_frame_from_cache(CacheIndex::Frame(f));
                }
            }
            if budget == 0 {
                continue;
            }

            let cached: HashSet<i32> = item.cached_frames().into_iter().collect();
            for f in window.filter(|f| !cached.contains(f)) {
                match &self.workers {
                    Some(w) => {
                        let item = Arc::clone(&item);
                        w.execute_with_epoch(epoch, move || item.cache_frame(f));
                    }
                    None => item.cache_frame(f),
                }
                scheduled += 1;
            }
        }
        scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache_man::CacheManager;
    use crate::core::event_bus::downcast_event;
    use crate::entities::geometry::Size;
    use crate::entities::item::LoadingState;
    use crate::entities::sources::PatternSource;
    use crate::entities::{DifferenceItem, OverlayItem, TextItem, VideoItem};

    fn video(pl: &Playlist, frames: i32) -> Arc<dyn Item> {
        Arc::new(VideoItem::new(
            pl.env(),
            "v",
            Arc::new(PatternSource::new(Size::new(4, 4), frames, 0)),
        ))
    }

    #[test]
    fn test_add_child_checks() {
        let mut pl = Playlist::for_tests();
        let diff: Arc<dyn Item> = Arc::new(DifferenceItem::new(pl.env()));
        let text: Arc<dyn Item> = Arc::new(TextItem::new(pl.env(), "t"));
        let d = pl.add_root(Arc::clone(&diff));
        let t = pl.add_root(Arc::clone(&text));

        assert_eq!(pl.add_child(t, video(&pl, 5)), Err(ItemError::NotAContainer(t)));
        assert_eq!(
            pl.add_child(d, Arc::clone(&text)),
            Err(ItemError::ChildRejected { parent: d, child: t })
        );
        pl.add_child(d, video(&pl, 5)).unwrap();
        pl.add_child(d, video(&pl, 5)).unwrap();
        assert_eq!(pl.add_child(d, video(&pl, 5)), Err(ItemError::ContainerFull { max: 2 }));
        assert_eq!(pl.add_child(d, Arc::clone(&diff)), Err(ItemError::CycleRejected));
        assert_eq!(diff.frame_range(), (0, 4));
    }

    #[test]
    fn test_reorder_children() {
        let mut pl = Playlist::for_tests();
        let o = pl.add_root(Arc::new(OverlayItem::new(pl.env())));
        let a = video(&pl, 5);
        let b = video(&pl, 5);
        pl.add_child(o, Arc::clone(&a)).unwrap();
        pl.add_child(o, Arc::clone(&b)).unwrap();
        pl.env().hub.drain();

        assert_eq!(pl.move_child(o, 1, 0), Ok(true));
        let overlay = pl.find(o).unwrap();
        assert_eq!(overlay.container().unwrap().child_ids(), vec![b.id(), a.id()]);
        assert_eq!(pl.process_events(), 1);

        assert_eq!(pl.move_child(o, 0, 2), Ok(false));
        assert_eq!(pl.move_child(a.id(), 0, 0), Err(ItemError::NotAContainer(a.id())));
    }

    #[test]
    fn test_move_between_containers() {
        let mut pl = Playlist::for_tests();
        let a = pl.add_root(Arc::new(OverlayItem::new(pl.env())));
        let b = pl.add_root(Arc::new(OverlayItem::new(pl.env())));
        let v = video(&pl, 3);
        let vid = v.id();
        pl.add_child(a, Arc::clone(&v)).unwrap();
        pl.add_child(b, v).unwrap();

        assert_eq!(pl.parent_of(vid).map(|p| p.id()), Some(b));
        assert!(pl.find(a).unwrap().children().is_empty());

        // Leaves cannot hold children
        let outer = pl.find(b).unwrap();
        assert_eq!(pl.add_child(vid, outer), Err(ItemError::NotAContainer(vid)));
    }

    #[test]
    fn test_events_reach_bus_after_ancestors() {
        let mut pl = Playlist::for_tests();
        let overlay = pl.add_root(Arc::new(OverlayItem::new(pl.env())));
        let v = video(&pl, 10);
        let vid = v.id();
        pl.add_child(overlay, Arc::clone(&v)).unwrap();
        pl.process_events();
        pl.bus().poll();

        v.load_frame(0, false, false);
        assert_eq!(pl.process_events(), 1);
        let events = pl.bus().poll();
        let ev = downcast_event::<ItemChangedEvent>(&events[0]).unwrap();
        assert_eq!(ev, &ItemChangedEvent { source: vid, root: overlay, redraw: true });
    }

    #[test]
    fn test_remove_drops_cache_and_selection() {
        let mut pl = Playlist::for_tests();
        let overlay = pl.add_root(Arc::new(OverlayItem::new(pl.env())));
        let v = video(&pl, 10);
        let vid = v.id();
        pl.add_child(overlay, Arc::clone(&v)).unwrap();
        v.cache_frame(1);
        pl.set_selected(Some(vid));
        assert_eq!(pl.env().cache.item_frame_count(vid), 1);

        pl.remove(overlay).unwrap();
        assert!(pl.is_empty());
        assert_eq!(pl.env().cache.item_frame_count(vid), 0);
        assert!(pl.selected().is_none());
        assert_eq!(pl.remove(overlay).unwrap_err(), ItemError::UnknownItem(overlay));
    }

    #[test]
    fn test_removing_child_resets_container() {
        let mut pl = Playlist::for_tests();
        let overlay = pl.add_root(Arc::new(OverlayItem::new(pl.env())));
        let v = video(&pl, 10);
        pl.add_child(overlay, Arc::clone(&v)).unwrap();
        let o = pl.find(overlay).unwrap();
        assert_eq!(o.frame_range(), (0, 9));

        pl.remove(v.id()).unwrap();
        assert_eq!(o.frame_range(), NO_RANGE);
    }

    #[test]
    fn test_source_polling() {
        let mut pl = Playlist::for_tests();
        let source = Arc::new(PatternSource::new(Size::new(2, 2), 4, 0));
        let item: Arc<dyn Item> = Arc::new(VideoItem::new(pl.env(), "p", source.clone()));
        let id = pl.add_root(Arc::clone(&item));
        item.cache_frame(0);

        assert!(pl.poll_source_changes().is_empty());
        source.touch();
        assert_eq!(pl.poll_source_changes(), vec![id]);
        assert!(item.cached_frames().is_empty());

        pl.process_events();
        let kinds: Vec<_> = pl
            .bus()
            .poll()
            .iter()
            .map(|e| downcast_event::<ItemCacheClearedEvent>(e).is_some())
            .collect();
        assert!(kinds.contains(&true));
    }

    #[test]
    fn test_caching_window() {
        // 4x4 RGBA = 64 bytes; 8 frames fit for one item
        let env = ItemEnv::with_manager(EngineConfig::default(), Arc::new(CacheManager::with_limit(8 * 64)));
        let mut pl = Playlist::with_env(env, None);
        let item = video(&pl, 20);
        pl.add_root(Arc::clone(&item));

        assert_eq!(pl.update_caching(5), 8);
        assert_eq!(item.cached_frames(), (5..13).collect::<Vec<_>>());

        // Moving the window drops frames that fell out of it
        pl.update_caching(10);
        assert_eq!(item.cached_frames(), (10..18).collect::<Vec<_>>());
        assert_eq!(item.needs_loading(10, false), LoadingState::NotNeeded);
    }

    #[test]
    fn test_schedule_load_on_workers() {
        let env = ItemEnv::for_tests();
        let workers = Workers::new(2, env.cache.manager().epoch_ref());
        let pl = Playlist::with_env(env, Some(workers));
        let item = video(&pl, 5);

        assert!(pl.schedule_load(&item, 2, false));
        assert!(pl.wait_idle(Duration::from_secs(5)));
        assert_eq!(item.needs_loading(2, false), LoadingState::NeededDoubleBuffer);
    }

    fn worker_playlist() -> Playlist {
        let env = ItemEnv::for_tests();
        let workers = Workers::new(1, env.cache.manager().epoch_ref());
        Playlist::with_env(env, Some(workers))
    }

    #[test]
    fn test_queued_caching_does_not_outlive_removal() {
        let mut pl = worker_playlist();
        let item: Arc<dyn Item> = Arc::new(VideoItem::new(
            pl.env(),
            "big",
            Arc::new(PatternSource::new(Size::new(64, 64), 300, 0)),
        ));
        let id = pl.add_root(Arc::clone(&item));

        assert_eq!(pl.update_caching(0), 300);
        pl.remove(id).unwrap();
        assert!(pl.wait_idle(Duration::from_secs(10)));
        assert_eq!(pl.env().cache.item_frame_count(id), 0);

        // Attached again, it caches like before
        pl.add_root(Arc::clone(&item));
        item.cache_frame(4);
        assert_eq!(item.cached_frames(), vec![4]);
    }

    #[test]
    fn test_queued_caching_does_not_outlive_reload() {
        let mut pl = worker_playlist();
        let source = Arc::new(PatternSource::new(Size::new(64, 64), 300, 0));
        let item: Arc<dyn Item> = Arc::new(VideoItem::new(pl.env(), "big", source.clone()));
        let id = pl.add_root(Arc::clone(&item));

        pl.update_caching(0);
        source.touch();
        assert_eq!(pl.poll_source_changes(), vec![id]);
        assert!(pl.wait_idle(Duration::from_secs(10)));
        assert!(item.cached_frames().is_empty());

        // One reload is one event on the bus
        pl.process_events();
        let events = pl.bus().poll();
        assert_eq!(events.len(), 1);
        let ev = downcast_event::<ItemCacheClearedEvent>(&events[0]).unwrap();
        assert_eq!(ev, &ItemCacheClearedEvent { source: id, root: id, redraw: true });
    }
}
