//! VideoItem - indexed leaf backed by a frame source.

use std::any::Any;
use std::sync::Arc;

use log::{info, trace, warn};

use super::frame_handler::FrameHandler;
use super::geometry::{Point, Size};
use super::item::{
    CacheIndex, InfoData, Item, ItemBase, ItemEnv, ItemKind, LoadingState, NO_RANGE, Timing,
};
use super::painter::Painter;
use super::source::FrameSource;
use super::values::ValuePairListSets;

/// Title of the pixel value set of a leaf
pub const PIXEL_SET: &str = "RGB";

#[derive(Debug)]
pub struct VideoItem {
    base: ItemBase,
    handler: FrameHandler,
}

impl VideoItem {
    pub fn new(env: &ItemEnv, name: impl Into<String>, source: Arc<dyn FrameSource>) -> Self {
        let fps = source.frame_rate().unwrap_or(env.config.default_frame_rate);
        let base = ItemBase::new(env, name, Timing::indexed(fps, source.frame_range()));
        let handler = FrameHandler::new(
            base.id(),
            source,
            Arc::clone(&env.cache),
            base.signals().clone(),
            env.config.caching_enabled,
            env.config.max_load_attempts,
        );
        Self { base, handler }
    }

    pub fn source(&self) -> &Arc<dyn FrameSource> {
        self.handler.source()
    }

    fn in_range(&self, frame: i32) -> bool {
        let (start, end) = self.base.frame_range();
        (start, end) != NO_RANGE && frame >= start && frame <= end
    }
}

impl Item for VideoItem {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Video
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn frame_limits(&self) -> (i32, i32) {
        self.handler.source().frame_range()
    }

    fn size(&self) -> Size {
        self.handler.frame_size()
    }

    fn set_frame_range(&self, range: (i32, i32)) {
        if self.base.set_user_range(range) {
            self.handler.reset_failures();
            self.base.signals().changed(true);
        }
    }

    fn frame_handler(&self) -> Option<&FrameHandler> {
        Some(&self.handler)
    }

    fn needs_loading(&self, frame: i32, _raw: bool) -> LoadingState {
        if !self.in_range(frame) {
            return LoadingState::NotNeeded;
        }
        self.handler
            .needs_loading(frame, self.base.frame_range(), self.base.sampling())
    }

    fn load_frame(&self, frame: i32, playback: bool, _raw: bool) {
        if !self.in_range(frame) {
            trace!("{}: frame {} outside range, not loading", self.base.id(), frame);
            return;
        }
        self.handler.load_frame(
            frame,
            self.base.frame_range(),
            self.base.sampling(),
            playback,
        );
    }

    fn is_loading(&self) -> bool {
        self.handler.is_loading()
    }

    fn is_loading_double_buffer(&self) -> bool {
        self.handler.is_loading_double_buffer()
    }

    fn activate_double_buffer(&self, frame: i32) {
        self.handler.activate_double_buffer(frame);
    }

    fn draw(&self, painter: &mut dyn Painter, frame: i32, zoom: f64, _raw: bool) {
        if self.base.frame_range() == NO_RANGE {
            painter.draw_text("No frames to show", zoom);
            return;
        }
        if let Some(f) = self.handler.display_frame(frame) {
            painter.draw_frame(&f, zoom);
        } else if self.handler.is_exhausted(frame) {
            painter.draw_text(&format!("Failed to load frame {}", frame), zoom);
        } else {
            trace!("{}: frame {} not loaded yet", self.base.id(), frame);
        }
    }

    fn pixel_values(&self, pos: Point, frame: i32) -> ValuePairListSets {
        let mut sets = ValuePairListSets::new();
        let values = self.handler.pixel_values(pos, frame);
        if !values.is_empty() {
            sets.append(PIXEL_SET, values);
        }
        sets
    }

    fn info(&self) -> InfoData {
        let mut info = InfoData::new("Video Info");
        let size = self.size();
        let (start, end) = self.base.frame_range();
        info.push("Source", self.handler.source().describe());
        info.push("Size", format!("({},{})", size.width, size.height));
        info.push("Frames", self.handler.source().frame_count().to_string());
        info.push("Range", format!("{}..{}", start, end));
        if let Some(fps) = self.base.frame_rate() {
            info.push("Frame rate", format!("{:.2}", fps));
        }
        info.push("Cached frames", self.handler.cached_frames().len().to_string());
        info
    }

    fn is_cachable(&self) -> bool {
        self.handler.is_caching_enabled() && self.base.frame_range() != NO_RANGE
    }

    fn set_caching_enabled(&self, enabled: bool) {
        self.handler.set_caching_enabled(enabled);
    }

    fn cache_frame(&self, frame: i32) {
        if self.in_range(frame) {
            self.handler.cache_frame(frame);
        }
    }

    fn cached_frames(&self) -> Vec<i32> {
        self.handler.cached_frames()
    }

    fn caching_frame_size(&self) -> usize {
        self.handler.caching_frame_size()
    }

    fn remove_frame_from_cache(&self, idx: CacheIndex) {
        self.handler.remove_frame_from_cache(idx);
    }

    fn is_source_changed(&self) -> bool {
        self.handler.source().is_changed()
    }

    fn on_removed(&self) {
        self.handler.retire();
    }

    fn on_added(&self) {
        self.handler.revive();
    }

    fn reload_item_source(&self) {
        match self.handler.reload() {
            Ok(()) => {
                let limits = self.handler.source().frame_range();
                self.base.update_limits(limits);
                info!("{}: source reloaded, frames {:?}", self.base.id(), limits);
            }
            Err(e) => warn!("{}: reload failed: {}", self.base.id(), e),
        }
    }
}
