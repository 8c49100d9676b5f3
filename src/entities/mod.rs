//! Entities module - the item tree and what it is made of
//!
//! - leaves: [`VideoItem`] (frame source backed), [`TextItem`] (static)
//! - containers: [`DifferenceItem`], [`OverlayItem`]
//! - [`Playlist`]: owner of the tree, change propagation, scheduling
//! - collaborators: frames, sources, painters, persistence

pub mod container;
pub mod difference;
pub mod frame;
pub mod frame_handler;
pub mod geometry;
pub mod item;
pub mod overlay;
pub mod painter;
pub mod persist;
pub mod playlist;
pub mod source;
pub mod sources;
pub mod text_item;
pub mod values;
pub mod video_item;

pub use difference::{DifferenceHandler, DifferenceItem};
pub use frame::{Frame, FrameError};
pub use frame_handler::FrameHandler;
pub use geometry::{Point, Rect, Size};
pub use item::{CacheIndex, InfoData, Item, ItemEnv, ItemError, ItemKind, LoadingState, NO_RANGE};
pub use overlay::{Alignment, OverlayItem};
pub use painter::{CanvasPainter, Painter, RecordingPainter};
pub use playlist::Playlist;
pub use source::{FrameSource, SourceSpec, open_source};
pub use text_item::TextItem;
pub use values::{ValuePair, ValuePairListSets};
pub use video_item::VideoItem;
