//! Leaf loading state machine.
//!
//! A [`FrameHandler`] owns the pixel slots of one leaf item:
//! - *current*: the frame being displayed
//! - *double buffer*: one look-ahead frame, only shown after
//!   [`activate_double_buffer`](FrameHandler::activate_double_buffer)
//!
//! Frames come from the global cache when present, otherwise from the
//! [`FrameSource`]. A frame that fails to read is retried up to
//! `max_load_attempts` times, then given up until the source is reloaded,
//! the cache is cleared or the range changes.
//!
//! Caching reads race with invalidation: a read that started before the
//! cache was cleared (reload, full clear, removal) must not land in the cache
//! afterwards. Every clear bumps a generation, and an insert only happens if
//! the generation it started under is still current.
//!
//! Only one load runs per handler at a time. A second `load_frame` while one
//! is in flight returns immediately; the driver asks again on the next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, trace, warn};

use super::frame::{Frame, FrameError};
use super::geometry::{Point, Size};
use super::item::{CacheIndex, LoadingState};
use super::source::FrameSource;
use super::values::ValuePair;
use crate::core::global_cache::GlobalFrameCache;
use crate::core::ids::ItemId;
use crate::core::signals::ItemSignals;

/// Current + look-ahead slot pair, each holding `(frame index, frame)`.
#[derive(Debug, Default)]
pub struct FrameSlots {
    current: Mutex<Option<(i32, Frame)>>,
    double_buffer: Mutex<Option<(i32, Frame)>>,
}

impl FrameSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, idx: i32) -> Option<Frame> {
        match &*self.current.lock().unwrap_or_else(|e| e.into_inner()) {
            Some((i, f)) if *i == idx => Some(f.clone()),
            _ => None,
        }
    }

    pub fn current_index(&self) -> Option<i32> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(i, _)| *i)
    }

    pub fn set_current(&self, idx: i32, frame: Frame) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some((idx, frame));
    }

    pub fn double_buffer_index(&self) -> Option<i32> {
        self.double_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(i, _)| *i)
    }

    /// Look-ahead frame, without activating it
    pub fn peek_double_buffer(&self, idx: i32) -> Option<Frame> {
        match &*self.double_buffer.lock().unwrap_or_else(|e| e.into_inner()) {
            Some((i, f)) if *i == idx => Some(f.clone()),
            _ => None,
        }
    }

    /// Store a look-ahead frame unless the slot holds `pending`, a frame that
    /// was loaded but not yet activated. `notify` runs while the slot is
    /// locked, so activation cannot be observed before the notification.
    pub fn store_double_buffer(
        &self,
        idx: i32,
        frame: Frame,
        pending: i32,
        notify: impl FnOnce(),
    ) -> bool {
        let mut slot = self.double_buffer.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(&*slot, Some((i, _)) if *i == pending) {
            return false;
        }
        *slot = Some((idx, frame));
        notify();
        true
    }

    /// Move the look-ahead frame into the current slot if it holds `frame`.
    /// A look-ahead for any other frame stays where it is.
    pub fn activate(&self, frame: i32) -> bool {
        let taken = {
            let mut slot = self.double_buffer.lock().unwrap_or_else(|e| e.into_inner());
            match &*slot {
                Some((idx, _)) if *idx == frame => slot.take(),
                _ => None,
            }
        };
        let Some((idx, frame)) = taken else {
            return false;
        };
        self.set_current(idx, frame);
        true
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.double_buffer.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Loading state given whether `frame` and `next` are available elsewhere
    /// (e.g. in the cache). `next` is None when there is no look-ahead frame.
    pub fn state(
        &self,
        frame: i32,
        next: Option<i32>,
        available: impl Fn(i32) -> bool,
    ) -> LoadingState {
        let have_current = self.current(frame).is_some() || available(frame);
        if have_current {
            let Some(next) = next else {
                return LoadingState::NotNeeded;
            };
            if self.double_buffer_index() == Some(next) || available(next) {
                LoadingState::NotNeeded
            } else {
                LoadingState::NeededDoubleBuffer
            }
        } else if self.double_buffer_index() == Some(frame) {
            LoadingState::NeededDoubleBuffer
        } else {
            LoadingState::Needed
        }
    }
}

/// Per-frame failure counts
#[derive(Debug, Default)]
struct Failures {
    counts: HashMap<i32, u32>,
}

/// Raw frame access for one leaf item.
pub struct FrameHandler {
    owner: ItemId,
    source: Arc<dyn FrameSource>,
    cache: Arc<GlobalFrameCache>,
    signals: ItemSignals,
    slots: FrameSlots,
    caching_enabled: AtomicBool,
    loading: AtomicBool,
    loading_double_buffer: AtomicBool,
    failures: Mutex<Failures>,
    max_attempts: u32,
    /// Bumped on every full invalidation; held for reading across inserts
    generation: RwLock<u64>,
    /// Owner left the tree; nothing is cached until it is attached again
    retired: AtomicBool,
}

impl std::fmt::Debug for FrameHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandler")
            .field("owner", &self.owner)
            .field("source", &self.source.describe())
            .field("current", &self.slots.current_index())
            .field("double_buffer", &self.slots.double_buffer_index())
            .finish()
    }
}

impl FrameHandler {
    pub fn new(
        owner: ItemId,
        source: Arc<dyn FrameSource>,
        cache: Arc<GlobalFrameCache>,
        signals: ItemSignals,
        caching_enabled: bool,
        max_attempts: u32,
    ) -> Self {
        Self {
            owner,
            source,
            cache,
            signals,
            slots: FrameSlots::new(),
            caching_enabled: AtomicBool::new(caching_enabled),
            loading: AtomicBool::new(false),
            loading_double_buffer: AtomicBool::new(false),
            failures: Mutex::new(Failures::default()),
            max_attempts: max_attempts.max(1),
            generation: RwLock::new(0),
            retired: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    pub fn frame_size(&self) -> Size {
        self.source.frame_size()
    }

    pub fn slots(&self) -> &FrameSlots {
        &self.slots
    }

    // --- retry bookkeeping ---

    pub fn is_exhausted(&self, frame: i32) -> bool {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.counts.get(&frame).copied().unwrap_or(0) >= self.max_attempts
    }

    /// Returns true if this failure used up the last attempt
    fn record_failure(&self, frame: i32, err: &FrameError) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.counts.entry(frame).or_insert(0);
        *count += 1;
        warn!(
            "{}: failed to load frame {} (attempt {}/{}): {}",
            self.owner, frame, count, self.max_attempts, err
        );
        if *count == self.max_attempts {
            warn!("{}: giving up on frame {}", self.owner, frame);
            return true;
        }
        false
    }

    pub fn reset_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counts
            .clear();
    }

    // --- availability ---

    fn in_cache(&self, frame: i32) -> bool {
        self.caching_enabled.load(Ordering::Relaxed) && self.cache.contains(self.owner, frame)
    }

    /// Frame `frame` from the current slot, the look-ahead slot or the cache
    pub fn frame_at(&self, frame: i32) -> Option<Frame> {
        if let Some(f) = self.slots.current(frame) {
            return Some(f);
        }
        if let Some(f) = self.slots.peek_double_buffer(frame) {
            return Some(f);
        }
        if self.caching_enabled.load(Ordering::Relaxed) {
            return self.cache.get(self.owner, frame);
        }
        None
    }

    /// Frame to display: current slot or cache, never the look-ahead slot
    pub fn display_frame(&self, frame: i32) -> Option<Frame> {
        if let Some(f) = self.slots.current(frame) {
            return Some(f);
        }
        if self.caching_enabled.load(Ordering::Relaxed) {
            return self.cache.get(self.owner, frame);
        }
        None
    }

    fn next_frame(&self, frame: i32, range: (i32, i32), step: i32) -> Option<i32> {
        let next = frame + step.max(1);
        (next <= range.1 && !self.is_exhausted(next)).then_some(next)
    }

    /// Pure: no I/O, no state change.
    pub fn needs_loading(&self, frame: i32, range: (i32, i32), step: i32) -> LoadingState {
        if self.is_exhausted(frame) {
            return LoadingState::NotNeeded;
        }
        let next = self.next_frame(frame, range, step);
        self.slots.state(frame, next, |f| self.in_cache(f))
    }

    fn fetch(&self, frame: i32) -> Result<Frame, FrameError> {
        if self.caching_enabled.load(Ordering::Relaxed)
            && let Some(f) = self.cache.get(self.owner, frame)
        {
            trace!("{}: frame {} from cache", self.owner, frame);
            return Ok(f);
        }
        self.source.read_frame(frame)
    }

    /// Load `frame` into the current slot if needed and, during playback, the
    /// next frame into the look-ahead slot.
    pub fn load_frame(&self, frame: i32, range: (i32, i32), step: i32, playback: bool) {
        if self.loading.swap(true, Ordering::AcqRel) {
            trace!("{}: load of {} skipped, already loading", self.owner, frame);
            return;
        }

        let state = self.needs_loading(frame, range, step);
        debug!("{}: load_frame {} playback={} state={:?}", self.owner, frame, playback, state);

        if state == LoadingState::Needed {
            match self.fetch(frame) {
                Ok(f) => {
                    self.slots.set_current(frame, f);
                    self.signals.changed(true);
                }
                Err(e) => {
                    if self.record_failure(frame, &e) {
                        self.signals.changed(true);
                    }
                }
            }
        }

        if playback
            && state != LoadingState::NotNeeded
            && let Some(next) = self.next_frame(frame, range, step)
            && self.slots.double_buffer_index() != Some(next)
            && self.slots.double_buffer_index() != Some(frame)
        {
            self.loading_double_buffer.store(true, Ordering::Release);
            match self.fetch(next) {
                Ok(f) => {
                    let signals = &self.signals;
                    self.slots.store_double_buffer(next, f, frame, || {
                        signals.double_buffer_loaded(next);
                    });
                }
                Err(e) => {
                    if self.record_failure(next, &e) {
                        self.signals.changed(true);
                    }
                }
            }
            self.loading_double_buffer.store(false, Ordering::Release);
        }

        self.loading.store(false, Ordering::Release);
    }

    pub fn activate_double_buffer(&self, frame: i32) {
        if self.slots.activate(frame) {
            trace!("{}: activated double buffer frame {}", self.owner, frame);
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn is_loading_double_buffer(&self) -> bool {
        self.loading_double_buffer.load(Ordering::Acquire)
    }

    pub fn pixel_values(&self, pos: Point, frame: i32) -> Vec<ValuePair> {
        self.frame_at(frame)
            .map(|f| f.pixel_values(pos))
            .unwrap_or_default()
    }

    // --- cache ---

    pub fn is_caching_enabled(&self) -> bool {
        self.caching_enabled.load(Ordering::Relaxed)
    }

    pub fn set_caching_enabled(&self, enabled: bool) {
        let was = self.caching_enabled.swap(enabled, Ordering::Relaxed);
        if was == enabled {
            return;
        }
        if !enabled {
            self.invalidate();
        }
        debug!("{}: caching {}", self.owner, if enabled { "enabled" } else { "disabled" });
    }

    /// Read `frame` into the global cache unless it is there already
    pub fn cache_frame(&self, frame: i32) {
        if !self.is_caching_enabled() || self.is_retired() || self.is_exhausted(frame) {
            return;
        }
        if self.cache.contains(self.owner, frame) {
            return;
        }
        let started = self.generation();
        match self.source.read_frame(frame) {
            Ok(f) => {
                let generation = self.generation.read().unwrap_or_else(|e| e.into_inner());
                if *generation != started || self.is_retired() || !self.is_caching_enabled() {
                    trace!("{}: dropping frame {} read before invalidation", self.owner, frame);
                    return;
                }
                self.cache.insert_if_absent(self.owner, frame, f);
            }
            Err(e) => {
                if self.record_failure(frame, &e) {
                    self.signals.changed(true);
                }
            }
        }
    }

    pub fn cached_frames(&self) -> Vec<i32> {
        self.cache.frames_of(self.owner)
    }

    pub fn caching_frame_size(&self) -> usize {
        let s = self.frame_size();
        if s.is_empty() { 0 } else { s.width as usize * s.height as usize * 4 }
    }

    pub fn remove_frame_from_cache(&self, idx: CacheIndex) {
        match idx {
            CacheIndex::Frame(i) => {
                self.cache.clear_frame(self.owner, i);
            }
            CacheIndex::All => {
                self.invalidate();
                self.reset_failures();
            }
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop every cached frame; reads in flight will not be inserted
    fn invalidate(&self) {
        let mut generation = self.generation.write().unwrap_or_else(|e| e.into_inner());
        *generation += 1;
        self.cache.clear_item(self.owner);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Owner removed from the tree: drop slots and cache, stop caching
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.slots.clear();
        self.invalidate();
        self.reset_failures();
        debug!("{}: retired", self.owner);
    }

    /// Owner attached to a tree again
    pub fn revive(&self) {
        if self.retired.swap(false, Ordering::AcqRel) {
            debug!("{}: revived", self.owner);
        }
    }

    /// Reload the source and drop everything derived from the old data.
    /// Emits a single cache-cleared signal with a redraw request.
    pub fn reload(&self) -> Result<(), FrameError> {
        self.source.reload()?;
        self.slots.clear();
        self.invalidate();
        self.reset_failures();
        self.signals.cache_cleared(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache_man::CacheManager;
    use crate::core::signals::{SignalHub, SignalKind};
    use crate::entities::sources::PatternSource;

    struct Fixture {
        hub: SignalHub,
        handler: FrameHandler,
    }

    fn fixture(caching: bool) -> Fixture {
        let hub = SignalHub::new();
        let cache = Arc::new(GlobalFrameCache::new(
            100,
            Arc::new(CacheManager::with_limit(64 * 1024 * 1024)),
        ));
        let source = Arc::new(PatternSource::new(Size::new(4, 4), 10, 0));
        let handler = FrameHandler::new(ItemId(1), source, cache, hub.signals_for(ItemId(1)), caching, 3);
        Fixture { hub, handler }
    }

    const RANGE: (i32, i32) = (0, 9);

    #[test]
    fn test_needs_loading_is_pure() {
        let fx = fixture(true);
        let a = fx.handler.needs_loading(3, RANGE, 1);
        let b = fx.handler.needs_loading(3, RANGE, 1);
        assert_eq!(a, LoadingState::Needed);
        assert_eq!(a, b);
        assert!(fx.hub.drain().is_empty());
        assert!(fx.handler.cached_frames().is_empty());
    }

    #[test]
    fn test_sync_load_then_double_buffer() {
        let fx = fixture(false);
        fx.handler.load_frame(3, RANGE, 1, false);
        assert!(fx.handler.display_frame(3).is_some());
        assert_eq!(fx.handler.needs_loading(3, RANGE, 1), LoadingState::NeededDoubleBuffer);
        assert_eq!(fx.hub.drain()[0].kind, SignalKind::Changed { redraw: true });

        fx.handler.load_frame(3, RANGE, 1, true);
        assert_eq!(fx.handler.slots().double_buffer_index(), Some(4));
        assert_eq!(fx.handler.needs_loading(3, RANGE, 1), LoadingState::NotNeeded);
        let events = fx.hub.drain();
        assert_eq!(events, vec![crate::core::signals::ItemEvent {
            source: ItemId(1),
            kind: SignalKind::DoubleBufferLoaded { frame: 4 },
        }]);

        // Look-ahead is not displayed before activation
        assert!(fx.handler.display_frame(4).is_none());
        assert_eq!(fx.handler.needs_loading(4, RANGE, 1), LoadingState::NeededDoubleBuffer);
        fx.handler.activate_double_buffer(5);
        assert!(fx.handler.display_frame(4).is_none());
        fx.handler.activate_double_buffer(4);
        assert!(fx.handler.display_frame(4).is_some());
    }

    #[test]
    fn test_no_look_ahead_at_range_end() {
        let fx = fixture(false);
        fx.handler.load_frame(9, RANGE, 1, true);
        assert!(fx.handler.display_frame(9).is_some());
        assert_eq!(fx.handler.slots().double_buffer_index(), None);
        assert_eq!(fx.handler.needs_loading(9, RANGE, 1), LoadingState::NotNeeded);
    }

    #[test]
    fn test_cache_hit_counts_as_loaded() {
        let fx = fixture(true);
        fx.handler.cache_frame(5);
        fx.handler.cache_frame(5);
        fx.handler.cache_frame(6);
        assert_eq!(fx.handler.cached_frames(), vec![5, 6]);
        assert_eq!(fx.handler.needs_loading(5, RANGE, 1), LoadingState::NotNeeded);
        assert_eq!(fx.handler.caching_frame_size(), 4 * 4 * 4);

        fx.handler.remove_frame_from_cache(CacheIndex::Frame(6));
        assert_eq!(fx.handler.needs_loading(5, RANGE, 1), LoadingState::NeededDoubleBuffer);
        fx.handler.remove_frame_from_cache(CacheIndex::All);
        assert!(fx.handler.cached_frames().is_empty());
    }

    #[test]
    fn test_disabling_cache_drops_frames() {
        let fx = fixture(true);
        fx.handler.cache_frame(1);
        fx.handler.set_caching_enabled(false);
        assert!(fx.handler.cached_frames().is_empty());
        fx.handler.cache_frame(1);
        assert!(fx.handler.cached_frames().is_empty());
    }

    #[test]
    fn test_reload_clears_and_signals() {
        let fx = fixture(true);
        fx.handler.load_frame(0, RANGE, 1, false);
        fx.handler.cache_frame(2);
        fx.hub.drain();

        fx.handler.reload().unwrap();
        assert!(fx.handler.display_frame(0).is_none());
        assert!(fx.handler.cached_frames().is_empty());
        assert_eq!(fx.hub.drain()[0].kind, SignalKind::CacheCleared { redraw: true });
    }

    /// Pattern source that runs a hook in the middle of the next read
    struct InterruptedSource {
        inner: PatternSource,
        during_read: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl FrameSource for InterruptedSource {
        fn spec(&self) -> crate::entities::source::SourceSpec {
            self.inner.spec()
        }
        fn describe(&self) -> String {
            "interrupted".into()
        }
        fn frame_size(&self) -> Size {
            self.inner.frame_size()
        }
        fn frame_range(&self) -> (i32, i32) {
            self.inner.frame_range()
        }
        fn frame_rate(&self) -> Option<f64> {
            None
        }
        fn read_frame(&self, idx: i32) -> Result<Frame, FrameError> {
            let hook = self.during_read.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.read_frame(idx)
        }
        fn is_changed(&self) -> bool {
            false
        }
        fn reload(&self) -> Result<(), FrameError> {
            Ok(())
        }
    }

    #[test]
    fn test_read_started_before_clear_is_not_cached() {
        let hub = SignalHub::new();
        let cache = Arc::new(GlobalFrameCache::new(
            100,
            Arc::new(CacheManager::with_limit(64 * 1024 * 1024)),
        ));
        let source = Arc::new(InterruptedSource {
            inner: PatternSource::new(Size::new(4, 4), 10, 0),
            during_read: Mutex::new(None),
        });
        let handler = Arc::new(FrameHandler::new(
            ItemId(1),
            source.clone(),
            cache,
            hub.signals_for(ItemId(1)),
            true,
            3,
        ));
        let h = Arc::clone(&handler);
        *source.during_read.lock().unwrap() =
            Some(Box::new(move || h.remove_frame_from_cache(CacheIndex::All)));

        let before = handler.generation();
        handler.cache_frame(2);
        assert_eq!(handler.generation(), before + 1);
        assert!(handler.cached_frames().is_empty());

        handler.cache_frame(2);
        assert_eq!(handler.cached_frames(), vec![2]);
    }

    #[test]
    fn test_retired_handler_stops_caching() {
        let fx = fixture(true);
        fx.handler.cache_frame(1);
        fx.handler.load_frame(1, RANGE, 1, false);

        fx.handler.retire();
        assert!(fx.handler.is_retired());
        assert!(fx.handler.cached_frames().is_empty());
        assert!(fx.handler.display_frame(1).is_none());
        fx.handler.cache_frame(2);
        assert!(fx.handler.cached_frames().is_empty());

        fx.handler.revive();
        fx.handler.cache_frame(2);
        assert_eq!(fx.handler.cached_frames(), vec![2]);
    }
}
