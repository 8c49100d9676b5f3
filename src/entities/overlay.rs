//! Overlay - container drawing all children on top of each other.
//!
//! ## Layout
//!
//! The first child's rectangle is centred on the origin and is the reference.
//! Every other child is anchored to the reference by the [`Alignment`] mode,
//! then shifted by the shared manual offset. The bounding rectangle is the
//! union of all child rectangles.
//!
//! Layout is recomputed when the child count changes; `update_layout(false)`
//! forces it (alignment change, child redraw).

use std::any::Any;
use std::sync::RwLock;

use log::debug;
use serde::{Deserialize, Serialize};

use super::container::{ContainerBase, LimitsMode};
use super::geometry::{Point, Rect, Size};
use super::item::{InfoData, Item, ItemBase, ItemEnv, ItemKind, LoadingState, NO_RANGE, Timing};
use super::painter::Painter;
use super::text_item::text_size;
use super::values::ValuePairListSets;
use crate::core::ids::ItemId;
use crate::core::signals::SignalKind;

pub const OVERLAY_INFO_TEXT: &str = "Please drop some items onto this overlay. All child items will be drawn on top of each other.";

/// Anchor of non-first children relative to the first one (indices 0..8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Alignment {
    #[default]
    TopLeft,
    TopCenter,
    TopRight,
    CenterLeft,
    Center,
    CenterRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

impl Alignment {
    pub const ALL: [Alignment; 9] = [
        Alignment::TopLeft,
        Alignment::TopCenter,
        Alignment::TopRight,
        Alignment::CenterLeft,
        Alignment::Center,
        Alignment::CenterRight,
        Alignment::BottomLeft,
        Alignment::BottomCenter,
        Alignment::BottomRight,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Alignment::TopLeft => "Top Left",
            Alignment::TopCenter => "Top Center",
            Alignment::TopRight => "Top Right",
            Alignment::CenterLeft => "Center Left",
            Alignment::Center => "Center",
            Alignment::CenterRight => "Center Right",
            Alignment::BottomLeft => "Bottom Left",
            Alignment::BottomCenter => "Bottom Center",
            Alignment::BottomRight => "Bottom Right",
        }
    }

    /// Place a rect of `size` relative to `reference`
    pub fn place(&self, size: Size, reference: &Rect) -> Rect {
        let mut r = Rect::centered(size, Point::ZERO);
        match self {
            Alignment::TopLeft => {
                r.move_left(reference.left());
                r.move_top(reference.top());
            }
            Alignment::TopCenter => r.move_top(reference.top()),
            Alignment::TopRight => {
                r.move_right(reference.right());
                r.move_top(reference.top());
            }
            Alignment::CenterLeft => r.move_left(reference.left()),
            Alignment::Center => {}
            Alignment::CenterRight => r.move_right(reference.right()),
            Alignment::BottomLeft => {
                r.move_left(reference.left());
                r.move_bottom(reference.bottom());
            }
            Alignment::BottomCenter => r.move_bottom(reference.bottom()),
            Alignment::BottomRight => {
                r.move_right(reference.right());
                r.move_bottom(reference.bottom());
            }
        }
        r
    }
}

#[derive(Debug, Default)]
struct Layout {
    rects: Vec<Rect>,
    bounding: Rect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Placement {
    alignment: Alignment,
    offset: Point,
}

#[derive(Debug)]
pub struct OverlayItem {
    base: ItemBase,
    container: ContainerBase,
    layout: RwLock<Layout>,
    placement: RwLock<Placement>,
}

fn scale(p: Point, zoom: f64) -> Point {
    Point::new(
        (p.x as f64 * zoom).round() as i32,
        (p.y as f64 * zoom).round() as i32,
    )
}

impl OverlayItem {
    pub fn new(env: &ItemEnv) -> Self {
        Self {
            base: ItemBase::new(
                env,
                "Overlay Item",
                Timing::indexed(env.config.default_frame_rate, NO_RANGE),
            ),
            container: ContainerBase::new(None, LimitsMode::Union),
            layout: RwLock::new(Layout::default()),
            placement: RwLock::new(Placement::default()),
        }
    }

    pub fn alignment(&self) -> Alignment {
        self.placement.read().unwrap_or_else(|e| e.into_inner()).alignment
    }

    pub fn manual_offset(&self) -> Point {
        self.placement.read().unwrap_or_else(|e| e.into_inner()).offset
    }

    /// Change alignment and offset. Unchanged values are a no-op without a
    /// signal. Returns whether anything changed.
    pub fn set_alignment(&self, alignment: Alignment, offset: Point) -> bool {
        let new = Placement { alignment, offset };
        {
            let mut p = self.placement.write().unwrap_or_else(|e| e.into_inner());
            if *p == new {
                return false;
            }
            *p = new;
        }
        self.update_layout(false);
        self.base.signals().changed(true);
        true
    }

    pub fn bounding_rect(&self) -> Rect {
        self.resync();
        self.layout.read().unwrap_or_else(|e| e.into_inner()).bounding
    }

    pub fn child_rects(&self) -> Vec<Rect> {
        self.resync();
        self.layout.read().unwrap_or_else(|e| e.into_inner()).rects.clone()
    }

    /// Recompute child rectangles. With `check_number` the work is skipped
    /// while the child count is unchanged. Returns whether it ran.
    pub fn update_layout(&self, check_number: bool) -> bool {
        let children = self.container.children();
        let mut layout = self.layout.write().unwrap_or_else(|e| e.into_inner());

        if children.is_empty() {
            layout.rects.clear();
            layout.bounding = Rect::default();
            return true;
        }
        if check_number && layout.rects.len() == children.len() {
            return false;
        }

        let placement = *self.placement.read().unwrap_or_else(|e| e.into_inner());
        let first = Rect::centered(children[0].size(), Point::ZERO);
        let mut rects = Vec::with_capacity(children.len());
        let mut bounding = first;
        rects.push(first);

        for child in &children[1..] {
            let mut r = placement.alignment.place(child.size(), &first);
            r.translate(placement.offset);
            bounding = bounding.united(&r);
            rects.push(r);
        }

        debug!(
            "{}: layout {} children, bounding {:?}",
            self.base.id(),
            rects.len(),
            bounding
        );
        layout.rects = rects;
        layout.bounding = bounding;
        true
    }

    fn refresh_limits(&self) {
        self.base.update_limits(self.container.merged_limits());
    }
}

impl Item for OverlayItem {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Overlay
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
        if self.container.is_empty() {
            return text_size(OVERLAY_INFO_TEXT);
        }
        self.layout.read().unwrap_or_else(|e| e.into_inner()).bounding.size()
    }

    fn container(&self) -> Option<&ContainerBase> {
        Some(&self.container)
    }

    fn accepts_child(&self, child: &dyn Item) -> bool {
        child.id() != self.base.id()
    }

    fn resync(&self) {
        if self.container.take_stale() {
            self.update_layout(false);
            self.refresh_limits();
        }
    }

    fn child_changed(&self, _source: ItemId, kind: SignalKind) {
        self.resync();
        if kind.redraw() {
            self.update_layout(false);
        }
        self.refresh_limits();
    }

    fn needs_loading(&self, frame: i32, raw: bool) -> LoadingState {
        self.resync();
        LoadingState::aggregate(
            self.container
                .children()
                .iter()
                .map(|c| c.needs_loading(frame, raw)),
        )
    }

    fn load_frame(&self, frame: i32, playback: bool, raw: bool) {
        self.resync();
        for child in self.container.children() {
            if child.needs_loading(frame, raw) != LoadingState::NotNeeded {
                child.load_frame(frame, playback, raw);
            }
        }
    }

    fn is_loading(&self) -> bool {
        self.container.children().iter().any(|c| c.is_loading())
    }

    fn is_loading_double_buffer(&self) -> bool {
        self.container
            .children()
            .iter()
            .any(|c| c.is_loading_double_buffer())
    }

    fn activate_double_buffer(&self, frame: i32) {
        for child in self.container.children() {
            child.activate_double_buffer(frame);
        }
    }

    fn draw(&self, painter: &mut dyn Painter, frame: i32, zoom: f64, raw: bool) {
        self.resync();
        let children = self.container.children();
        if children.is_empty() {
            painter.draw_text(OVERLAY_INFO_TEXT, zoom);
            return;
        }
        self.update_layout(true);

        let (rects, bounding) = {
            let layout = self.layout.read().unwrap_or_else(|e| e.into_inner());
            (layout.rects.clone(), layout.bounding)
        };

        let to_center = scale(bounding.center(), zoom);
        painter.translate(-to_center);
        for (child, rect) in children.iter().zip(rects.iter()) {
            let c = scale(rect.center(), zoom);
            painter.translate(c);
            child.draw(painter, frame, zoom, raw);
            painter.translate(-c);
        }
        painter.translate(to_center);
    }

    fn pixel_values(&self, pos: Point, frame: i32) -> ValuePairListSets {
        self.resync();
        let (rects, bounding) = {
            let layout = self.layout.read().unwrap_or_else(|e| e.into_inner());
            (layout.rects.clone(), layout.bounding)
        };
        let rel = bounding.top_left() + pos;

        let mut sets = ValuePairListSets::new();
        for (i, (child, rect)) in self.container.children().iter().zip(rects.iter()).enumerate() {
            if !rect.contains(rel) {
                continue;
            }
            let child_sets = child
                .pixel_values(rel - rect.top_left(), frame)
                .map_titles(|t| format!("Item {} - {}", i, t));
            sets.extend(child_sets);
        }
        sets
    }

    fn info(&self) -> InfoData {
        let mut info = InfoData::new("Overlay Info");
        let size = self.size();
        info.push("Overlay Size", format!("({},{})", size.width, size.height));
        for (i, child) in self.container.children().iter().enumerate() {
            let s = child.size();
            info.push(format!("Item {} size", i), format!("({},{})", s.width, s.height));
        }
        info
    }
}
