//! Core engine modules - cache, events, player, workers
//!
//! These modules form the loading engine, independent of any UI.

pub mod cache_man;
pub mod event_bus;
pub mod global_cache;
pub mod ids;
pub mod player;
pub mod signals;
pub mod workers;

// Re-exports for convenience
pub use cache_man::CacheManager;
pub use event_bus::EventBus;
pub use global_cache::{CacheStats, GlobalFrameCache};
pub use ids::{IdAllocator, ItemId};
pub use player::{Player, TickOutcome};
pub use signals::{ItemEvent, ItemSignals, SignalHub, SignalKind};
pub use workers::Workers;
