//! Presence broadcasting to passive observers
//!
//! Two delivery paths share one snapshot: registered observer tokens each
//! get their own channel (a dead observer is logged and dropped, never
//! blocking the rest), and a broadcast channel feeds the SSE endpoint.

use crate::RoomId;
use cadenza_common::events::PresenceUpdate;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Fan-out point for one session's presence updates
pub struct PresenceBroadcaster {
    room: RoomId,
    observers: Mutex<HashMap<String, mpsc::UnboundedSender<PresenceUpdate>>>,
    tx: broadcast::Sender<PresenceUpdate>,
}

impl PresenceBroadcaster {
    pub fn new(room: RoomId) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            room,
            observers: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Subscribe the SSE stream (or any transient consumer)
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.tx.subscribe()
    }

    /// Register a named observer token; replaces any previous channel for
    /// the same token
    pub fn register_observer(&self, token: impl Into<String>) -> mpsc::UnboundedReceiver<PresenceUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .expect("observer map poisoned")
            .insert(token.into(), tx);
        rx
    }

    pub fn unregister_observer(&self, token: &str) {
        self.observers
            .lock()
            .expect("observer map poisoned")
            .remove(token);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().expect("observer map poisoned").len()
    }

    /// Deliver one update everywhere. Individual observer failures are
    /// logged and the observer dropped; delivery to the others continues.
    pub fn broadcast(&self, update: PresenceUpdate) {
        // No SSE subscribers is fine
        let _ = self.tx.send(update.clone());

        let mut dead = Vec::new();
        {
            let observers = self.observers.lock().expect("observer map poisoned");
            for (token, tx) in observers.iter() {
                if tx.send(update.clone()).is_err() {
                    warn!(room = self.room, token, "Observer channel closed; dropping");
                    dead.push(token.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut observers = self.observers.lock().expect("observer map poisoned");
            for token in dead {
                observers.remove(&token);
            }
        }
        debug!(room = self.room, "Presence update delivered");
    }
}
