//! Typed pub/sub bus for the top-level consumer of the item tree.
//!
//! The playlist publishes here only after containers have resynchronised, so
//! subscribers always see a consistent tree.
//!
//! - `subscribe::<E>()` callbacks run synchronously inside `emit()`
//! - `emit()` also queues the event; `poll()` hands the queue to a main loop
//!
//! Callback order is FIFO within one event type. Order across types is not
//! defined.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

use super::ids::ItemId;

/// Maximum events in queue before the oldest half is evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// Anything that can travel over the bus.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

pub type BoxedEvent = Box<dyn Event>;

// ============================================================================
// Tree events
// ============================================================================

/// An item (or something below it) changed. `root` is the top-level item
/// whose subtree contains `source`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemChangedEvent {
    pub source: ItemId,
    pub root: ItemId,
    pub redraw: bool,
}

/// Cached frames of `source` must be treated as stale. Carries the redraw
/// request of the same change, so a reload arrives as one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemCacheClearedEvent {
    pub source: ItemId,
    pub root: ItemId,
    pub redraw: bool,
}

/// A look-ahead frame is ready for activation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoubleBufferLoadedEvent {
    pub source: ItemId,
    pub frame: i32,
}

/// The player is waiting for a frame that is not loaded yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackStalledEvent {
    pub root: ItemId,
    pub frame: i32,
}

// ============================================================================
// Bus
// ============================================================================

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>,
    queue: Arc<Mutex<Vec<BoxedEvent>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to events of type E.
    ///
    /// # Example
    /// ```ignore
    /// bus.subscribe::<ItemChangedEvent, _>(move |e| {
    ///     if e.redraw { needs_repaint.store(true, Ordering::Relaxed); }
    /// });
    /// ```
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Invoke subscribers, then queue for `poll()`.
    pub fn emit<E: Event + Clone>(&self, event: E) {
        if let Some(cbs) = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
        {
            for cb in cbs {
                cb(&event);
            }
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict_count = queue.len() / 2;
            warn!(
                "EventBus queue full ({} events), evicting oldest {}",
                queue.len(),
                evict_count
            );
            queue.drain(0..evict_count);
        }
        queue.push(Box::new(event));
    }

    /// Take every queued event
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Downcast a polled event.
///
/// Deref to `dyn Event` first: calling `as_any()` on the `Box` itself would go
/// through the blanket impl and yield the box, so the downcast would fail.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_emit_immediate() {
        let bus = EventBus::new();
        let redraws = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&redraws);
        bus.subscribe::<ItemChangedEvent, _>(move |e| {
            if e.redraw {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.emit(ItemChangedEvent { source: ItemId(1), root: ItemId(0), redraw: true });
        bus.emit(ItemChangedEvent { source: ItemId(1), root: ItemId(0), redraw: false });
        assert_eq!(redraws.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_poll_and_downcast() {
        let bus = EventBus::new();
        bus.emit(DoubleBufferLoadedEvent { source: ItemId(4), frame: 11 });
        bus.emit(ItemCacheClearedEvent { source: ItemId(4), root: ItemId(2), redraw: true });

        let events = bus.poll();
        assert_eq!(events.len(), 2);
        assert_eq!(
            downcast_event::<DoubleBufferLoadedEvent>(&events[0]).map(|e| e.frame),
            Some(11)
        );
        assert!(downcast_event::<ItemChangedEvent>(&events[1]).is_none());
        assert_eq!(bus.queue_len(), 0);
    }

    #[test]
    fn test_subscriber_only_sees_its_type() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe::<PlaybackStalledEvent, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(DoubleBufferLoadedEvent { source: ItemId(1), frame: 3 });
        bus.emit(PlaybackStalledEvent { root: ItemId(0), frame: 3 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.poll().len(), 2);
    }
}
