//! Room membership and event fan-out.
//!
//! A room is either a note id (content changes of that note) or a tree room
//! `{root}/` (existence changes in that notebook). Each connected client has
//! an outlet: the queue of JSON frames its writer task sends out.

use paper_core::protocol::{encode, ServerMessage};
use paper_core::NoteEvent;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Outgoing frame queue of one client
pub type Outlet = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct Inner {
    outlets: HashMap<String, Outlet>,
    members: HashMap<String, HashSet<String>>,
    joined: HashMap<String, HashSet<String>>,
}

/// Connected clients and the rooms they joined
#[derive(Default)]
pub struct Rooms {
    inner: RwLock<Inner>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: &str, outlet: Outlet) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.outlets.insert(client_id.to_string(), outlet);
    }

    /// Forget a client and leave all its rooms.
    pub fn unregister(&self, client_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.outlets.remove(client_id);
        if let Some(rooms) = inner.joined.remove(client_id) {
            for room in rooms {
                if let Some(members) = inner.members.get_mut(&room) {
                    members.remove(client_id);
                    if members.is_empty() {
                        inner.members.remove(&room);
                    }
                }
            }
        }
    }

    pub fn join(&self, client_id: &str, room: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .members
            .entry(room.to_string())
            .or_default()
            .insert(client_id.to_string());
        inner
            .joined
            .entry(client_id.to_string())
            .or_default()
            .insert(room.to_string());
        debug!("{} joined {}", client_id, room);
    }

    pub fn leave(&self, client_id: &str, room: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = inner.members.get_mut(room) {
            members.remove(client_id);
            if members.is_empty() {
                inner.members.remove(room);
            }
        }
        if let Some(rooms) = inner.joined.get_mut(client_id) {
            rooms.remove(room);
        }
    }

    /// Members of `room`, sorted.
    pub fn members(&self, room: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut members: Vec<String> = inner
            .members
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .outlets
            .len()
    }

    /// Queue `message` for one client. Returns false if the client is gone.
    pub fn send_to(&self, client_id: &str, message: &ServerMessage) -> bool {
        let frame = match encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode message for {}: {}", client_id, e);
                return false;
            }
        };
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match inner.outlets.get(client_id) {
            Some(outlet) => outlet.send(frame).is_ok(),
            None => false,
        }
    }

    /// Queue `event` for every member of its room except its originator.
    /// Returns the number of clients it was queued for.
    pub fn publish(&self, event: &NoteEvent) -> usize {
        let frame = match encode(&ServerMessage::from_event(event)) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode event: {}", e);
                return 0;
            }
        };

        let room = event.room();
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(members) = inner.members.get(&room) else {
            return 0;
        };

        let mut delivered = 0;
        for client_id in members.iter().filter(|id| event.is_for(id)) {
            if let Some(outlet) = inner.outlets.get(client_id) {
                if outlet.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!("Published {} to {} client(s)", room, delivered);
        delivered
    }
}
