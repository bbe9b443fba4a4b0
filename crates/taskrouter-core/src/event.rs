//! Typed event bus
//!
//! Every entity instance and the worker own one [`Emitter`]. Dispatch is
//! synchronous: `emit` runs callback listeners inline and pushes into each
//! channel subscriber before returning, so listeners observe events in the
//! order the processing loop applied them.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle returned by [`Emitter::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Listener<E> {
    Callback(Callback<E>),
    Channel(mpsc::UnboundedSender<E>),
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        match self {
            Listener::Callback(f) => Listener::Callback(f.clone()),
            Listener::Channel(tx) => Listener::Channel(tx.clone()),
        }
    }
}

/// Multi-subscriber event emitter.
///
/// Channel subscribers are unbounded so a slow consumer never loses an
/// event; dropping the receiver unsubscribes it on the next emit.
pub struct Emitter<E> {
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E: Clone> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback invoked on the processing loop for every event.
    ///
    /// Callbacks must not block; reading entity fields from inside them is fine.
    pub fn on<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.push(Listener::Callback(Arc::new(f)))
    }

    /// Subscribe with a channel receiver
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Listener::Channel(tx));
        rx
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every listener in registration order.
    pub fn emit(&self, event: E) {
        // Snapshot first so a callback may register or remove listeners.
        let listeners: Vec<(ListenerId, Listener<E>)> = self.listeners.read().clone();
        let mut closed = Vec::new();

        for (id, listener) in listeners {
            match listener {
                Listener::Callback(f) => f(&event),
                Listener::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.listeners.write().retain(|(id, _)| !closed.contains(id));
        }
    }

    fn push(&self, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }
}
