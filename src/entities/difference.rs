//! Difference - container of exactly two items showing `A - B` per pixel.
//!
//! The inputs are the frame handlers of the two children. With fewer than two
//! children (or a child without a handler) the item is valid but only draws
//! an explanatory text. The range is the intersection of both inputs.
//!
//! The computed difference has its own current/look-ahead slots, so the
//! loading state aggregates child A, child B and the difference itself.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, trace};
use rayon::prelude::*;

use super::container::{ContainerBase, LimitsMode};
use super::frame::Frame;
use super::frame_handler::FrameSlots;
use super::geometry::{Point, Size};
use super::item::{
    CacheIndex, InfoData, Item, ItemBase, ItemEnv, ItemKind, LoadingState, NO_RANGE, Timing,
};
use super::painter::Painter;
use super::text_item::text_size;
use super::values::ValuePairListSets;
use crate::core::ids::ItemId;
use crate::core::signals::SignalKind;

pub const DIFFERENCE_INFO_TEXT: &str =
    "Please drop two video items onto this difference item to calculate the difference.";

pub const SET_A: &str = "Item A";
pub const SET_B: &str = "Item B";
pub const SET_DIFF: &str = "Diff (A-B)";

/// Output of one difference computation
#[derive(Debug, Clone)]
pub struct DiffResult {
    /// Signed RGB difference, alpha 255
    pub frame: Frame,
    /// First differing pixel in raster order
    pub first_difference: Option<Point>,
    /// Mean squared error per R, G, B
    pub mse: [f64; 3],
}

/// Pixel-wise subtraction of two frames over their common area.
#[derive(Debug, Default, Clone, Copy)]
pub struct DifferenceHandler;

impl DifferenceHandler {
    pub fn compute(a: &Frame, b: &Frame) -> DiffResult {
        let w = a.width().min(b.width());
        let h = a.height().min(b.height());
        let mut out = vec![0.0f32; w * h * 4];
        if w == 0 || h == 0 {
            return DiffResult {
                frame: Frame::from_f32_buffer(out, w, h),
                first_difference: None,
                mse: [0.0; 3],
            };
        }

        // Per row: squared error sums and first differing column
        let rows: Vec<([f64; 3], Option<usize>)> = out
            .par_chunks_mut(w * 4)
            .enumerate()
            .map(|(y, row)| {
                let mut sse = [0.0f64; 3];
                let mut first = None;
                for x in 0..w {
                    let p = Point::new(x as i32, y as i32);
                    let (Some(pa), Some(pb)) = (a.pixel(p), b.pixel(p)) else {
                        continue;
                    };
                    let px = &mut row[x * 4..x * 4 + 4];
                    for c in 0..3 {
                        let d = pa[c] - pb[c];
                        px[c] = d;
                        sse[c] += (d as f64) * (d as f64);
                        if d != 0.0 && first.is_none() {
                            first = Some(x);
                        }
                    }
                    px[3] = 255.0;
                }
                (sse, first)
            })
            .collect();

        let mut total = [0.0f64; 3];
        let mut first_difference = None;
        for (y, (sse, first)) in rows.iter().enumerate() {
            for c in 0..3 {
                total[c] += sse[c];
            }
            if first_difference.is_none()
                && let Some(x) = first
            {
                first_difference = Some(Point::new(*x as i32, y as i32));
            }
        }
        let n = (w * h) as f64;
        DiffResult {
            frame: Frame::from_f32_buffer(out, w, h),
            first_difference,
            mse: [total[0] / n, total[1] / n, total[2] / n],
        }
    }
}

type Inputs = (Arc<dyn Item>, Arc<dyn Item>);

/// Statistics of the last computed difference, for `info()`
#[derive(Debug, Clone, Copy)]
struct DiffStats {
    frame: i32,
    first_difference: Option<Point>,
    mse: [f64; 3],
}

pub struct DifferenceItem {
    base: ItemBase,
    container: ContainerBase,
    inputs: RwLock<Option<Inputs>>,
    slots: FrameSlots,
    /// Statistics of the last computed difference
    last: Mutex<Option<DiffStats>>,
    loading: AtomicBool,
    loading_double_buffer: AtomicBool,
}

impl std::fmt::Debug for DifferenceItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifferenceItem")
            .field("id", &self.base.id())
            .field("children", &self.container.child_ids())
            .finish()
    }
}

impl DifferenceItem {
    pub const MAX_ITEMS: usize = 2;

    pub fn new(env: &ItemEnv) -> Self {
        Self {
            base: ItemBase::new(
                env,
                "Difference Item",
                Timing::indexed(env.config.default_frame_rate, NO_RANGE),
            ),
            container: ContainerBase::new(Some(Self::MAX_ITEMS), LimitsMode::Intersection),
            inputs: RwLock::new(None),
            slots: FrameSlots::new(),
            last: Mutex::new(None),
            loading: AtomicBool::new(false),
            loading_double_buffer: AtomicBool::new(false),
        }
    }

    fn inputs(&self) -> Option<Inputs> {
        self.inputs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Both children present and both expose a frame handler
    pub fn inputs_valid(&self) -> bool {
        self.resync();
        self.inputs().is_some()
    }

    fn in_range(&self, frame: i32) -> bool {
        let (start, end) = self.base.frame_range();
        (start, end) != NO_RANGE && frame >= start && frame <= end
    }

    fn next_frame(&self, frame: i32) -> Option<i32> {
        let next = frame + self.base.sampling();
        (next <= self.base.frame_range().1 && !self.input_failed(next)).then_some(next)
    }

    /// An input gave up on `frame`, so there is nothing to compute
    fn input_failed(&self, frame: i32) -> bool {
        let Some((a, b)) = self.inputs() else {
            return false;
        };
        [a, b]
            .iter()
            .any(|c| c.frame_handler().is_some_and(|h| h.is_exhausted(frame)))
    }

    fn compute(&self, frame: i32) -> Option<DiffResult> {
        let (a, b) = self.inputs()?;
        let fa = a.frame_handler()?.frame_at(frame)?;
        let fb = b.frame_handler()?.frame_at(frame)?;
        Some(DifferenceHandler::compute(&fa, &fb))
    }

    fn remember(&self, frame: i32, r: &DiffResult) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(DiffStats {
            frame,
            first_difference: r.first_difference,
            mse: r.mse,
        });
    }

    /// Difference frame for display or probing, without side effects
    fn diff_frame(&self, frame: i32) -> Option<Frame> {
        self.slots
            .current(frame)
            .or_else(|| self.slots.peek_double_buffer(frame))
            .or_else(|| self.compute(frame).map(|r| r.frame))
    }

    fn refresh_limits(&self) {
        self.base.update_limits(self.container.merged_limits());
    }
}

impl Item for DifferenceItem {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Difference
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn frame_limits(&self) -> (i32, i32) {
        self.container.merged_limits()
    }

    fn frame_range(&self) -> (i32, i32) {
        self.resync();
        self.base.frame_range()
    }

    fn size(&self) -> Size {
        self.resync();
        match self.inputs() {
            Some((a, b)) => a.size().min(b.size()),
            None => text_size(DIFFERENCE_INFO_TEXT),
        }
    }

    fn container(&self) -> Option<&ContainerBase> {
        Some(&self.container)
    }

    fn accepts_child(&self, child: &dyn Item) -> bool {
        child.id() != self.base.id() && child.frame_handler().is_some() && !self.container.is_full()
    }

    fn resync(&self) {
        if !self.container.take_stale() {
            return;
        }
        let children = self.container.children();
        let inputs = match (children.first(), children.get(1)) {
            (Some(a), Some(b)) if a.frame_handler().is_some() && b.frame_handler().is_some() => {
                Some((Arc::clone(a), Arc::clone(b)))
            }
            _ => None,
        };
        debug!(
            "{}: difference inputs {}",
            self.base.id(),
            if inputs.is_some() { "valid" } else { "incomplete" }
        );
        *self.inputs.write().unwrap_or_else(|e| e.into_inner()) = inputs;
        self.slots.clear();
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.refresh_limits();
    }

    fn child_changed(&self, _source: ItemId, kind: SignalKind) {
        self.resync();
        match kind {
            SignalKind::CacheCleared { .. } => {
                self.slots.clear();
                *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
                self.refresh_limits();
            }
            SignalKind::Changed { .. } => self.refresh_limits(),
            SignalKind::DoubleBufferLoaded { .. } => {}
        }
    }

    fn needs_loading(&self, frame: i32, raw: bool) -> LoadingState {
        self.resync();
        let Some((a, b)) = self.inputs() else {
            return LoadingState::NotNeeded;
        };
        if !self.in_range(frame) || self.input_failed(frame) {
            return LoadingState::NotNeeded;
        }
        let own = self.slots.state(frame, self.next_frame(frame), |_| false);
        LoadingState::aggregate([a.needs_loading(frame, raw), b.needs_loading(frame, raw), own])
    }

    fn load_frame(&self, frame: i32, playback: bool, raw: bool) {
        self.resync();
        let Some((a, b)) = self.inputs() else {
            return;
        };
        if !self.in_range(frame) || self.loading.swap(true, Ordering::AcqRel) {
            return;
        }

        let state = self.needs_loading(frame, raw);
        trace!("{}: load_frame {} state={:?}", self.base.id(), frame, state);

        if state == LoadingState::Needed {
            for child in [&a, &b] {
                if child.needs_loading(frame, raw) == LoadingState::Needed {
                    child.load_frame(frame, false, raw);
                }
            }
            if self.slots.current(frame).is_none()
                && let Some(r) = self.compute(frame)
            {
                self.remember(frame, &r);
                self.slots.set_current(frame, r.frame);
                self.base.signals().changed(true);
            }
        }

        if playback
            && state != LoadingState::NotNeeded
            && let Some(next) = self.next_frame(frame)
            && self.slots.double_buffer_index() != Some(next)
            && self.slots.double_buffer_index() != Some(frame)
        {
            self.loading_double_buffer.store(true, Ordering::Release);
            for child in [&a, &b] {
                child.load_frame(frame, true, raw);
            }
            if let Some(r) = self.compute(next) {
                let signals = self.base.signals();
                self.slots.store_double_buffer(next, r.frame, frame, || {
                    signals.double_buffer_loaded(next);
                });
            }
            self.loading_double_buffer.store(false, Ordering::Release);
        }

        self.loading.store(false, Ordering::Release);
    }

    fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire) || self.children().iter().any(|c| c.is_loading())
    }

    fn is_loading_double_buffer(&self) -> bool {
        self.loading_double_buffer.load(Ordering::Acquire)
            || self.children().iter().any(|c| c.is_loading_double_buffer())
    }

    fn activate_double_buffer(&self, frame: i32) {
        for child in self.children() {
            child.activate_double_buffer(frame);
        }
        if self.slots.activate(frame) {
            trace!("{}: activated difference frame {}", self.base.id(), frame);
        }
    }

    fn draw(&self, painter: &mut dyn Painter, frame: i32, zoom: f64, _raw: bool) {
        self.resync();
        if self.inputs().is_none() {
            painter.draw_text(DIFFERENCE_INFO_TEXT, zoom);
            return;
        }
        if self.base.frame_range() == NO_RANGE {
            painter.draw_text("The inputs have no frames in common", zoom);
            return;
        }
        match self.slots.current(frame) {
            Some(f) => painter.draw_frame(&f, zoom),
            None if self.input_failed(frame) => {
                painter.draw_text(&format!("Failed to load frame {}", frame), zoom)
            }
            None => trace!("{}: difference {} not loaded yet", self.base.id(), frame),
        }
    }

    fn pixel_values(&self, pos: Point, frame: i32) -> ValuePairListSets {
        self.resync();
        let mut sets = ValuePairListSets::new();
        let children = self.container.children();
        let handlers: Vec<_> = children.iter().filter_map(|c| c.frame_handler()).collect();

        if let Some(h) = handlers.first() {
            sets.append(SET_A, h.pixel_values(pos, frame));
        }
        if let Some(h) = handlers.get(1) {
            sets.append(SET_B, h.pixel_values(pos, frame));
            let diff = self
                .diff_frame(frame)
                .map(|f| f.pixel_values(pos))
                .unwrap_or_default();
            sets.append(SET_DIFF, diff);
        }
        sets
    }

    fn info(&self) -> InfoData {
        self.resync();
        let mut info = InfoData::new("Difference Info");
        let children = self.container.children();
        if let Some(c) = children.first() {
            info.push("File 1", c.name());
        }
        if let Some(c) = children.get(1) {
            info.push("File 2", c.name());
        }
        let last = *self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(DiffStats { frame, first_difference, mse }) = last {
            match first_difference {
                Some(p) => info.push("First Difference", format!("frame {} at ({},{})", frame, p.x, p.y)),
                None => info.push("First Difference", format!("frame {}: frames are identical", frame)),
            }
            info.push("MSE R", format!("{:.4}", mse[0]));
            info.push("MSE G", format!("{:.4}", mse[1]));
            info.push("MSE B", format!("{:.4}", mse[2]));
            info.push("MSE All", format!("{:.4}", (mse[0] + mse[1] + mse[2]) / 3.0));
        }
        info
    }

    fn remove_frame_from_cache(&self, idx: CacheIndex) {
        if idx == CacheIndex::All {
            self.slots.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::painter::RecordingPainter;
    use crate::entities::sources::PatternSource;
    use crate::entities::{TextItem, VideoItem};

    fn video(env: &ItemEnv, size: Size, frames: i32, seed: u32) -> Arc<dyn Item> {
        Arc::new(VideoItem::new(env, "v", Arc::new(PatternSource::new(size, frames, seed))))
    }

    #[test]
    fn test_difference_handler_math() {
        let a = Frame::solid(3, 2, [10, 20, 30, 255]);
        let b = Frame::solid(2, 2, [10, 25, 30, 255]);
        let r = DifferenceHandler::compute(&a, &b);
        assert_eq!(r.frame.size(), Size::new(2, 2));
        assert_eq!(r.first_difference, Some(Point::new(0, 0)));
        assert_eq!(r.mse, [0.0, 25.0, 0.0]);
        assert_eq!(r.frame.pixel(Point::new(1, 1)), Some([0.0, -5.0, 0.0, 255.0]));

        let same = DifferenceHandler::compute(&a, &a);
        assert_eq!(same.first_difference, None);
    }

    #[test]
    fn test_incomplete_difference_draws_text() {
        let env = ItemEnv::for_tests();
        let diff = DifferenceItem::new(&env);
        let mut p = RecordingPainter::new();
        diff.draw(&mut p, 0, 1.0, false);
        assert_eq!(p.texts(), vec![DIFFERENCE_INFO_TEXT]);
        assert_eq!(diff.frame_range(), NO_RANGE);

        diff.container.insert(None, video(&env, Size::new(4, 4), 10, 0)).unwrap();
        assert!(!diff.inputs_valid());
        assert_eq!(diff.needs_loading(0, false), LoadingState::NotNeeded);
        diff.load_frame(0, false, false);
        let sets = diff.pixel_values(Point::new(0, 0), 0);
        assert_eq!(sets.titles(), vec![SET_A]);
    }

    #[test]
    fn test_accepts_only_frame_handlers() {
        let env = ItemEnv::for_tests();
        let diff = DifferenceItem::new(&env);
        let text = TextItem::new(&env, "t");
        assert!(!diff.accepts_child(&text));
        let v = video(&env, Size::new(2, 2), 1, 0);
        assert!(diff.accepts_child(v.as_ref()));
        diff.container.insert(None, Arc::clone(&v)).unwrap();
        diff.container.insert(None, video(&env, Size::new(2, 2), 1, 0)).unwrap();
        assert!(!diff.accepts_child(video(&env, Size::new(2, 2), 1, 0).as_ref()));
    }

    #[test]
    fn test_difference_load_and_info() {
        let env = ItemEnv::for_tests();
        let diff = DifferenceItem::new(&env);
        diff.container.insert(None, video(&env, Size::new(6, 4), 20, 0)).unwrap();
        diff.container.insert(None, video(&env, Size::new(4, 4), 10, 1)).unwrap();

        assert!(diff.inputs_valid());
        assert_eq!(diff.frame_range(), (0, 9));
        assert_eq!(diff.size(), Size::new(4, 4));
        assert_eq!(diff.needs_loading(3, false), LoadingState::Needed);

        diff.load_frame(3, false, false);
        assert_eq!(diff.needs_loading(3, false), LoadingState::NeededDoubleBuffer);
        let mut p = RecordingPainter::new();
        diff.draw(&mut p, 3, 1.0, false);
        assert_eq!(p.frames(), vec![(Point::ZERO, Size::new(4, 4))]);

        let info = diff.info();
        assert_eq!(info.title, "Difference Info");
        assert!(info.get("MSE R").is_some());
        assert!(info.get("First Difference").is_some());
    }

    #[test]
    fn test_playback_fills_double_buffer() {
        let env = ItemEnv::for_tests();
        let diff = DifferenceItem::new(&env);
        diff.container.insert(None, video(&env, Size::new(4, 4), 10, 0)).unwrap();
        diff.container.insert(None, video(&env, Size::new(4, 4), 10, 0)).unwrap();

        diff.load_frame(0, true, false);
        assert_eq!(diff.slots.double_buffer_index(), Some(1));
        assert_eq!(diff.needs_loading(0, false), LoadingState::NotNeeded);
        assert_eq!(diff.needs_loading(1, false), LoadingState::NeededDoubleBuffer);

        diff.activate_double_buffer(2);
        assert!(diff.slots.current(1).is_none());
        diff.activate_double_buffer(1);
        assert!(diff.slots.current(1).is_some());
        // Identical inputs
        let r = DifferenceHandler::compute(
            &diff.container.child(0).unwrap().frame_handler().unwrap().frame_at(1).unwrap(),
            &diff.container.child(1).unwrap().frame_handler().unwrap().frame_at(1).unwrap(),
        );
        assert_eq!(r.first_difference, None);
    }

    #[test]
    fn test_failed_input_gives_up_instead_of_stalling() {
        let env = ItemEnv::for_tests();
        let diff = DifferenceItem::new(&env);
        let bad = Arc::new(PatternSource::new(Size::new(4, 4), 10, 1));
        bad.set_failing(true);
        diff.container.insert(None, video(&env, Size::new(4, 4), 10, 0)).unwrap();
        diff.container
            .insert(None, Arc::new(VideoItem::new(&env, "bad", bad)))
            .unwrap();

        // Each load spends one attempt of the failing input
        for _ in 0..env.config.max_load_attempts {
            assert_eq!(diff.needs_loading(3, false), LoadingState::Needed);
            diff.load_frame(3, false, false);
        }
        assert_eq!(diff.needs_loading(3, false), LoadingState::NotNeeded);

        let mut p = RecordingPainter::new();
        diff.draw(&mut p, 3, 1.0, false);
        assert_eq!(p.texts(), vec!["Failed to load frame 3"]);
        assert!(p.frames().is_empty());

        // Frames the input has not given up on are still wanted
        assert_eq!(diff.needs_loading(4, false), LoadingState::Needed);
    }

    #[test]
    fn test_no_look_ahead_into_failed_frame() {
        let env = ItemEnv::for_tests();
        let diff = DifferenceItem::new(&env);
        let flaky = Arc::new(PatternSource::new(Size::new(4, 4), 10, 1));
        diff.container.insert(None, video(&env, Size::new(4, 4), 10, 0)).unwrap();
        let b: Arc<dyn Item> = Arc::new(VideoItem::new(&env, "flaky", flaky.clone()));
        diff.container.insert(None, Arc::clone(&b)).unwrap();
        diff.load_frame(2, false, false);

        flaky.set_failing(true);
        for _ in 0..env.config.max_load_attempts {
            b.load_frame(3, false, false);
        }
        // Frame 3 will never arrive, so it is not prefetched
        assert_eq!(diff.next_frame(2), None);
        assert_eq!(diff.next_frame(3), Some(4));
        assert_eq!(diff.needs_loading(3, false), LoadingState::NotNeeded);
    }
}
