//! Item trait - common interface of everything that can sit in the playlist.
//!
//! Items form a tree:
//! - leaves ([`VideoItem`](super::VideoItem), [`TextItem`](super::TextItem))
//!   own their data
//! - containers ([`DifferenceItem`](super::DifferenceItem),
//!   [`OverlayItem`](super::OverlayItem)) derive it from their children
//!
//! Items are shared as `Arc<dyn Item>`: workers run `load_frame` while the
//! coordinating thread draws, so all state lives behind interior mutability
//! and every method takes `&self`.
//!
//! ## Addressing
//!
//! Every item is either *static* (shown for a duration) or *indexed* (frames
//! `start..=end`). The mode is chosen at construction and never changes.
//! `(-1, -1)` is the range of an indexed item that has nothing to show yet.

use std::any::Any;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;
use thiserror::Error;

use super::container::ContainerBase;
use super::frame_handler::FrameHandler;
use super::geometry::{Point, Size};
use super::painter::Painter;
use super::values::ValuePairListSets;
use crate::config::EngineConfig;
use crate::core::cache_man::CacheManager;
use crate::core::global_cache::GlobalFrameCache;
use crate::core::ids::{IdAllocator, ItemId};
use crate::core::signals::{ItemSignals, SignalHub, SignalKind};

/// Range of an indexed item that cannot be drawn
pub const NO_RANGE: (i32, i32) = (-1, -1);

/// Answer of `needs_loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    /// Frame (and look-ahead, if relevant) is ready
    NotNeeded,
    /// Frame must be loaded before it can be drawn
    Needed,
    /// Frame is ready or waiting for activation; the look-ahead slot needs work
    NeededDoubleBuffer,
}

impl LoadingState {
    /// Container rule: Needed if any is Needed, else NeededDoubleBuffer if any
    /// is, else NotNeeded.
    pub fn aggregate(states: impl IntoIterator<Item = LoadingState>) -> LoadingState {
        let mut out = LoadingState::NotNeeded;
        for s in states {
            match s {
                LoadingState::Needed => return LoadingState::Needed,
                LoadingState::NeededDoubleBuffer => out = LoadingState::NeededDoubleBuffer,
                LoadingState::NotNeeded => {}
            }
        }
        out
    }
}

/// Argument of `remove_frame_from_cache`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheIndex {
    Frame(i32),
    All,
}

/// Titled key/value list for info panels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoData {
    pub title: String,
    pub items: Vec<(String, String)>,
}

impl InfoData {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), items: Vec::new() }
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("Container already holds the maximum of {max} items")]
    ContainerFull { max: usize },
    #[error("Item {0} cannot hold children")]
    NotAContainer(ItemId),
    #[error("Unknown item {0}")]
    UnknownItem(ItemId),
    #[error("An item cannot be placed inside itself")]
    CycleRejected,
    #[error("Item {child} is not accepted by {parent}")]
    ChildRejected { parent: ItemId, child: ItemId },
}

/// Concrete item type, used for persistence and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Video,
    Text,
    Difference,
    Overlay,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Video => "Video",
            ItemKind::Text => "Text",
            ItemKind::Difference => "Difference",
            ItemKind::Overlay => "Overlay",
        }
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Frame-indexed addressing
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedTiming {
    pub frame_rate: f64,
    pub sampling: i32,
    /// Inclusive `[start, end]`
    pub range: (i32, i32),
    /// Auto-detected limits the range follows unless overridden
    pub limits: (i32, i32),
    /// Range was set by the user
    pub user_override: bool,
}

/// Temporal addressing of an item, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Timing {
    Static { duration: f64 },
    Indexed(IndexedTiming),
}

impl Timing {
    pub fn indexed(frame_rate: f64, limits: (i32, i32)) -> Self {
        Timing::Indexed(IndexedTiming {
            frame_rate,
            sampling: 1,
            range: limits,
            limits,
            user_override: false,
        })
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, Timing::Indexed(_))
    }
}

fn clamp_range(range: (i32, i32), limits: (i32, i32)) -> (i32, i32) {
    if limits.0 < 0 || limits.1 < limits.0 {
        return NO_RANGE;
    }
    let start = range.0.clamp(limits.0, limits.1);
    let end = range.1.clamp(start, limits.1);
    (start, end)
}

// ============================================================================
// ItemBase
// ============================================================================

/// State shared by every item kind.
#[derive(Debug)]
pub struct ItemBase {
    id: ItemId,
    name: RwLock<String>,
    /// Id from a loaded playlist file; only valid while loading
    playlist_id: Mutex<Option<u32>>,
    timing: RwLock<Timing>,
    signals: ItemSignals,
}

impl ItemBase {
    pub fn new(env: &ItemEnv, name: impl Into<String>, timing: Timing) -> Self {
        let id = env.ids.allocate();
        Self {
            id,
            name: RwLock::new(name.into()),
            playlist_id: Mutex::new(None),
            timing: RwLock::new(timing),
            signals: env.hub.signals_for(id),
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = name.into();
    }

    pub fn signals(&self) -> &ItemSignals {
        &self.signals
    }

    pub fn playlist_id(&self) -> Option<u32> {
        *self.playlist_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_playlist_id(&self, id: Option<u32>) {
        *self.playlist_id.lock().unwrap_or_else(|e| e.into_inner()) = id;
    }

    pub fn timing(&self) -> Timing {
        self.timing.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_indexed(&self) -> bool {
        self.timing.read().unwrap_or_else(|e| e.into_inner()).is_indexed()
    }

    /// Inclusive frame range; `NO_RANGE` for static items
    pub fn frame_range(&self) -> (i32, i32) {
        match &*self.timing.read().unwrap_or_else(|e| e.into_inner()) {
            Timing::Indexed(t) => t.range,
            Timing::Static { .. } => NO_RANGE,
        }
    }

    pub fn sampling(&self) -> i32 {
        match &*self.timing.read().unwrap_or_else(|e| e.into_inner()) {
            Timing::Indexed(t) => t.sampling.max(1),
            Timing::Static { .. } => 1,
        }
    }

    pub fn frame_rate(&self) -> Option<f64> {
        match &*self.timing.read().unwrap_or_else(|e| e.into_inner()) {
            Timing::Indexed(t) => Some(t.frame_rate),
            Timing::Static { .. } => None,
        }
    }

    pub fn duration(&self) -> Option<f64> {
        match &*self.timing.read().unwrap_or_else(|e| e.into_inner()) {
            Timing::Static { duration } => Some(*duration),
            Timing::Indexed(_) => None,
        }
    }

    pub fn is_range_overridden(&self) -> bool {
        match &*self.timing.read().unwrap_or_else(|e| e.into_inner()) {
            Timing::Indexed(t) => t.user_override,
            Timing::Static { .. } => false,
        }
    }

    /// New auto-detected limits. The range follows them, or is clamped to
    /// them when user-overridden. Returns true if the range changed.
    pub fn update_limits(&self, limits: (i32, i32)) -> bool {
        let mut timing = self.timing.write().unwrap_or_else(|e| e.into_inner());
        let Timing::Indexed(t) = &mut *timing else {
            return false;
        };
        t.limits = limits;
        let new_range = if t.user_override { clamp_range(t.range, limits) } else { limits };
        let changed = new_range != t.range;
        t.range = new_range;
        changed
    }

    /// User override of the range, clamped to the limits
    pub fn set_user_range(&self, range: (i32, i32)) -> bool {
        let mut timing = self.timing.write().unwrap_or_else(|e| e.into_inner());
        let Timing::Indexed(t) = &mut *timing else {
            return false;
        };
        if range.0 > range.1 {
            warn!("Ignoring reversed frame range {:?}", range);
            return false;
        }
        let new_range = clamp_range(range, t.limits);
        t.user_override = true;
        let changed = new_range != t.range;
        t.range = new_range;
        changed
    }

    pub fn set_frame_rate(&self, fps: f64) {
        if let Timing::Indexed(t) = &mut *self.timing.write().unwrap_or_else(|e| e.into_inner()) {
            t.frame_rate = fps;
        }
    }

    pub fn set_sampling(&self, sampling: i32) {
        if let Timing::Indexed(t) = &mut *self.timing.write().unwrap_or_else(|e| e.into_inner()) {
            t.sampling = sampling.max(1);
        }
    }

    pub fn set_duration(&self, duration: f64) {
        if let Timing::Static { duration: d } =
            &mut *self.timing.write().unwrap_or_else(|e| e.into_inner())
        {
            *d = duration.max(0.0);
        }
    }
}

// ============================================================================
// ItemEnv
// ============================================================================

/// Shared services handed to item constructors.
#[derive(Debug, Clone)]
pub struct ItemEnv {
    pub ids: Arc<IdAllocator>,
    pub hub: SignalHub,
    pub cache: Arc<GlobalFrameCache>,
    pub config: Arc<EngineConfig>,
}

impl ItemEnv {
    /// Environment sized from system memory
    pub fn new(config: EngineConfig) -> Self {
        let manager = Arc::new(CacheManager::new(
            config.cache_mem_fraction,
            config.cache_reserve_gb,
        ));
        Self::with_manager(config, manager)
    }

    pub fn with_manager(config: EngineConfig, manager: Arc<CacheManager>) -> Self {
        Self {
            ids: Arc::new(IdAllocator::new()),
            hub: SignalHub::new(),
            cache: Arc::new(GlobalFrameCache::new(config.cache_capacity, manager)),
            config: Arc::new(config),
        }
    }

    /// Small fixed cache budget, independent of the machine
    pub fn for_tests() -> Self {
        Self::with_manager(
            EngineConfig::default(),
            Arc::new(CacheManager::with_limit(256 * 1024 * 1024)),
        )
    }
}

// ============================================================================
// Item trait
// ============================================================================

/// Base trait for all item types.
pub trait Item: Send + Sync + Any {
    fn base(&self) -> &ItemBase;

    fn kind(&self) -> ItemKind;

    fn as_any(&self) -> &dyn Any;

    fn id(&self) -> ItemId {
        self.base().id()
    }

    fn name(&self) -> String {
        self.base().name()
    }

    fn is_indexed(&self) -> bool {
        self.base().is_indexed()
    }

    fn frame_range(&self) -> (i32, i32) {
        self.base().frame_range()
    }

    /// Auto-detected range before any user override
    fn frame_limits(&self) -> (i32, i32);

    /// Natural size in pixels
    fn size(&self) -> Size;

    /// Set a user range. Emits a redraw.
    fn set_frame_range(&self, range: (i32, i32)) {
        if self.base().set_user_range(range) {
            self.base().signals().changed(true);
        }
    }

    // --- capabilities ---

    /// Raw pixel access for leaf items
    fn frame_handler(&self) -> Option<&FrameHandler> {
        None
    }

    fn container(&self) -> Option<&ContainerBase> {
        None
    }

    fn children(&self) -> Vec<Arc<dyn Item>> {
        self.container().map(|c| c.children()).unwrap_or_default()
    }

    /// Whether `child` may be added to this item
    fn accepts_child(&self, _child: &dyn Item) -> bool {
        false
    }

    /// Resynchronise derived per-child state if the child list is stale
    fn resync(&self) {}

    /// A descendant emitted `kind`. Called on every ancestor, nearest first,
    /// before the event reaches the top-level consumer.
    fn child_changed(&self, _source: ItemId, _kind: SignalKind) {}

    // --- loading ---

    /// Pure: answers from slot and cache contents only
    fn needs_loading(&self, _frame: i32, _raw: bool) -> LoadingState {
        LoadingState::NotNeeded
    }

    /// Load `frame` (and, during playback, the look-ahead frame). May block.
    fn load_frame(&self, _frame: i32, _playback: bool, _raw: bool) {}

    fn is_loading(&self) -> bool {
        false
    }

    fn is_loading_double_buffer(&self) -> bool {
        false
    }

    /// Promote the look-ahead frame to the current one if it holds `frame`
    fn activate_double_buffer(&self, _frame: i32) {}

    // --- drawing ---

    fn draw(&self, painter: &mut dyn Painter, frame: i32, zoom: f64, raw: bool);

    /// Labeled values at `pos` (item pixel coordinates)
    fn pixel_values(&self, _pos: Point, _frame: i32) -> ValuePairListSets {
        ValuePairListSets::new()
    }

    fn info(&self) -> InfoData;

    // --- caching ---

    fn is_cachable(&self) -> bool {
        false
    }

    fn set_caching_enabled(&self, _enabled: bool) {}

    /// Idempotent; safe to call concurrently for different frames
    fn cache_frame(&self, _frame: i32) {}

    /// Advisory snapshot
    fn cached_frames(&self) -> Vec<i32> {
        Vec::new()
    }

    /// Bytes one cached frame costs
    fn caching_frame_size(&self) -> usize {
        0
    }

    fn remove_frame_from_cache(&self, _idx: CacheIndex) {}

    // --- source ---

    /// One-shot: true once after the backing source changed
    fn is_source_changed(&self) -> bool {
        false
    }

    fn reload_item_source(&self) {}

    /// The item is being removed from the tree
    fn on_removed(&self) {
        for child in self.children() {
            child.on_removed();
        }
        self.remove_frame_from_cache(CacheIndex::All);
    }

    /// The item (with its subtree) was attached to a tree
    fn on_added(&self) {
        for child in self.children() {
            child.on_added();
        }
    }
}

impl std::fmt::Debug for dyn Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} \"{}\"", self.kind().as_str(), self.id(), self.name())
    }
}

/// Pre-order list of `item` and every descendant
pub fn item_and_all_children(item: &Arc<dyn Item>) -> Vec<Arc<dyn Item>> {
    let mut out = vec![Arc::clone(item)];
    for child in item.children() {
        out.extend(item_and_all_children(&child));
    }
    out
}
