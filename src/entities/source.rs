//! Frame sources: where leaf items get their pixels.
//!
//! A source is shared between the item and worker threads, so every method
//! takes `&self`. Change detection is one-shot: `is_changed()` returns true
//! once per detected change and the owner answers with `reload()`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::frame::{Frame, FrameError};
use super::geometry::Size;
use super::sources::{PatternSource, SequenceSource};

/// Backing store of a leaf item.
pub trait FrameSource: Send + Sync {
    /// Serializable description used to rebuild the source
    fn spec(&self) -> SourceSpec;

    /// Human readable description for info panels
    fn describe(&self) -> String;

    /// Natural size of every frame
    fn frame_size(&self) -> Size;

    /// Inclusive range of readable frame indices, `(-1, -1)` when empty
    fn frame_range(&self) -> (i32, i32);

    fn frame_count(&self) -> i32 {
        let (start, end) = self.frame_range();
        if start < 0 || end < start { 0 } else { end - start + 1 }
    }

    /// Native rate if the source knows one
    fn frame_rate(&self) -> Option<f64>;

    /// Decode one frame. May block on I/O.
    fn read_frame(&self, idx: i32) -> Result<Frame, FrameError>;

    /// True once after the backing data changed
    fn is_changed(&self) -> bool;

    /// Re-read metadata after a change
    fn reload(&self) -> Result<(), FrameError>;
}

/// Serialized form of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Synthetic gradient, frames `0..frames`
    Pattern {
        width: i32,
        height: i32,
        frames: i32,
        #[serde(default)]
        seed: u32,
        #[serde(default)]
        fps: Option<f64>,
    },
    /// Image sequence (`*` marks the frame number) or a single still
    Sequence {
        mask: String,
        #[serde(default)]
        fps: Option<f64>,
    },
}

/// Build a source from its description
pub fn open_source(spec: &SourceSpec) -> Result<Arc<dyn FrameSource>, FrameError> {
    match spec {
        SourceSpec::Pattern { width, height, frames, seed, fps } => {
            let mut src = PatternSource::new(Size::new(*width, *height), *frames, *seed);
            if let Some(fps) = fps {
                src = src.with_fps(*fps);
            }
            Ok(Arc::new(src))
        }
        SourceSpec::Sequence { mask, fps } => {
            let src = SequenceSource::open(mask, *fps)?;
            Ok(Arc::new(src))
        }
    }
}
