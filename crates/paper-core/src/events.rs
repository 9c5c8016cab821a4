//! Change notifications emitted by the note store.
//!
//! `EventBus` is held in an `Arc`; subscribers get a `Subscription` handle
//! that unsubscribes when dropped.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::diff3::Patch;
use crate::hash::ContentHash;

/// Something changed in the note namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NoteEvent {
    /// A note's content changed by `patch`, resulting in `hash`.
    #[serde(rename_all = "camelCase")]
    NoteChanged {
        id: String,
        hash: ContentHash,
        patch: Patch,
        /// Client that caused the change; it is not notified of its own edit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },
    /// A note under `root_id` was created or emptied.
    #[serde(rename_all = "camelCase")]
    TreeChanged { root_id: String },
}

impl NoteEvent {
    /// Room whose members receive this event: the note id for content changes,
    /// the tree room of the notebook for hierarchy changes.
    pub fn room(&self) -> String {
        match self {
            NoteEvent::NoteChanged { id, .. } => id.clone(),
            NoteEvent::TreeChanged { root_id } => tree_room(root_id),
        }
    }

    /// Client that caused the event, if any.
    pub fn origin(&self) -> Option<&str> {
        match self {
            NoteEvent::NoteChanged { origin, .. } => origin.as_deref(),
            NoteEvent::TreeChanged { .. } => None,
        }
    }

    /// Whether a client with `client_id` should be told about this event.
    /// Clients never hear about their own edits.
    pub fn is_for(&self, client_id: &str) -> bool {
        self.origin() != Some(client_id)
    }
}

/// Room name for hierarchy notifications of the notebook containing `id`.
pub fn tree_room(id: &str) -> String {
    format!("{}/", crate::path::root_id(id))
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(&NoteEvent) + Send + Sync>;

/// Event bus for publishing note events to subscribers.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&NoteEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: NoteEvent) {
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }
}
