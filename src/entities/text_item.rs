//! TextItem - static leaf showing a line of text for a fixed duration.

use std::any::Any;
use std::sync::RwLock;

use super::geometry::Size;
use super::item::{InfoData, Item, ItemBase, ItemEnv, ItemKind, Timing};
use super::painter::Painter;

/// Approximate glyph box used for layout
const GLYPH_W: i32 = 8;
const GLYPH_H: i32 = 16;

/// Layout size of `text` drawn without zoom
pub fn text_size(text: &str) -> Size {
    let longest = text.lines().map(|l| l.chars().count()).max().unwrap_or(0) as i32;
    let lines = text.lines().count().max(1) as i32;
    Size::new(longest.max(1) * GLYPH_W, lines * GLYPH_H)
}

#[derive(Debug)]
pub struct TextItem {
    base: ItemBase,
    text: RwLock<String>,
}

impl TextItem {
    pub fn new(env: &ItemEnv, text: impl Into<String>) -> Self {
        let text = text.into();
        let duration = env.config.default_static_duration;
        Self {
            base: ItemBase::new(env, "Text", Timing::Static { duration }),
            text: RwLock::new(text),
        }
    }

    pub fn text(&self) -> String {
        self.text.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        let text = text.into();
        {
            let mut cur = self.text.write().unwrap_or_else(|e| e.into_inner());
            if *cur == text {
                return;
            }
            *cur = text;
        }
        self.base.signals().changed(true);
    }
}

impl Item for TextItem {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Text
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn frame_limits(&self) -> (i32, i32) {
        super::item::NO_RANGE
    }

    fn size(&self) -> Size {
        text_size(&self.text.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn draw(&self, painter: &mut dyn Painter, _frame: i32, zoom: f64, _raw: bool) {
        painter.draw_text(&self.text(), zoom);
    }

    fn info(&self) -> InfoData {
        let mut info = InfoData::new("Text Info");
        info.push("Text", self.text());
        if let Some(d) = self.base.duration() {
            info.push("Duration", format!("{:.2}s", d));
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::item::LoadingState;
    use crate::entities::painter::RecordingPainter;

    #[test]
    fn test_text_item_is_static() {
        let env = ItemEnv::for_tests();
        let item = TextItem::new(&env, "hello\nworld!");
        assert!(!item.is_indexed());
        assert_eq!(item.base().duration(), Some(5.0));
        assert_eq!(item.size(), Size::new(6 * GLYPH_W, 2 * GLYPH_H));
        assert_eq!(item.needs_loading(0, false), LoadingState::NotNeeded);
        assert!(item.frame_handler().is_none());
    }

    #[test]
    fn test_set_text_signals_once() {
        let env = ItemEnv::for_tests();
        let item = TextItem::new(&env, "a");
        item.set_text("b");
        item.set_text("b");
        assert_eq!(env.hub.drain().len(), 1);

        let mut p = RecordingPainter::new();
        item.draw(&mut p, 0, 1.0, false);
        assert_eq!(p.texts(), vec!["b"]);
    }
}
