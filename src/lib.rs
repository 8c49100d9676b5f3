//! playtree - composable item tree with frame loading, caching and playback
//!
//! Re-exports all modules for use by binary targets.

// Core engine (cache, events, player, workers)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;

// Re-export commonly used types from core
pub use core::cache_man::CacheManager;
pub use core::event_bus::{BoxedEvent, EventBus, downcast_event};
pub use core::global_cache::GlobalFrameCache;
pub use core::player::{Player, TickOutcome};

// Re-export entities
pub use entities::{Frame, Item, ItemEnv, Playlist};
