//! Child → tree change signals.
//!
//! Every item owns an [`ItemSignals`] handle. Items emit from whatever thread
//! they run on (loads happen on workers); the events land in one channel that
//! the [`Playlist`](crate::entities::Playlist) drains on the coordinating
//! thread. Draining walks the ancestor chain so containers resync their
//! derived state before the event is published to the top-level consumer.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use log::trace;

use super::ids::ItemId;

/// What happened to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Something visible changed; redraw if `redraw` is set
    Changed { redraw: bool },
    /// Cached frames of the item are invalid; redraw if `redraw` is set
    CacheCleared { redraw: bool },
    /// Look-ahead frame finished loading (informational)
    DoubleBufferLoaded { frame: i32 },
}

impl SignalKind {
    /// Whether the consumer should repaint
    pub fn redraw(&self) -> bool {
        match self {
            SignalKind::Changed { redraw } | SignalKind::CacheCleared { redraw } => *redraw,
            SignalKind::DoubleBufferLoaded { .. } => false,
        }
    }
}

/// One emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemEvent {
    pub source: ItemId,
    pub kind: SignalKind,
}

/// Emitter bound to one item.
#[derive(Debug, Clone)]
pub struct ItemSignals {
    id: ItemId,
    tx: Option<Sender<ItemEvent>>,
}

impl ItemSignals {
    pub fn new(id: ItemId, tx: Sender<ItemEvent>) -> Self {
        Self { id, tx: Some(tx) }
    }

    /// Emitter that drops everything (items built outside a playlist)
    pub fn dummy(id: ItemId) -> Self {
        Self { id, tx: None }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn emit(&self, kind: SignalKind) {
        trace!("signal {} {:?}", self.id, kind);
        if let Some(tx) = &self.tx {
            // Receiver gone means the playlist was dropped; nothing to notify.
            let _ = tx.send(ItemEvent { source: self.id, kind });
        }
    }

    pub fn changed(&self, redraw: bool) {
        self.emit(SignalKind::Changed { redraw });
    }

    pub fn cache_cleared(&self, redraw: bool) {
        self.emit(SignalKind::CacheCleared { redraw });
    }

    pub fn double_buffer_loaded(&self, frame: i32) {
        self.emit(SignalKind::DoubleBufferLoaded { frame });
    }
}

/// Receiving end, owned by the playlist.
#[derive(Debug, Clone)]
pub struct SignalHub {
    tx: Sender<ItemEvent>,
    rx: Receiver<ItemEvent>,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHub {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn signals_for(&self, id: ItemId) -> ItemSignals {
        ItemSignals::new(id, self.tx.clone())
    }

    /// Drain everything queued so far, in emission order
    pub fn drain(&self) -> Vec<ItemEvent> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(ev) => out.push(ev),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_drain_in_order() {
        let hub = SignalHub::new();
        let s = hub.signals_for(ItemId(7));
        s.changed(true);
        s.double_buffer_loaded(3);
        s.cache_cleared(true);

        let events = hub.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, SignalKind::Changed { redraw: true });
        assert_eq!(events[1].kind, SignalKind::DoubleBufferLoaded { frame: 3 });
        assert_eq!(events[2].kind, SignalKind::CacheCleared { redraw: true });
        assert!(events[2].kind.redraw());
        assert!(!events[1].kind.redraw());
        assert!(events.iter().all(|e| e.source == ItemId(7)));
        assert!(hub.drain().is_empty());
    }

    #[test]
    fn test_dummy_signals_are_silent() {
        let s = ItemSignals::dummy(ItemId(1));
        s.changed(false);
        assert_eq!(s.id(), ItemId(1));
    }
}
