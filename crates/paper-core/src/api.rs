//! Client-facing note operations.
//!
//! `NoteApi` is what a document session talks to. Implementations:
//! - `LocalApi` - In-process, directly over a `NoteService` (tests, embedding)
//! - `RpcClient` (in paper-client) - Over the WebSocket protocol

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::diff3::Patch;
use crate::error::ApiError;
use crate::events::{tree_room, EventBus, Subscription};
use crate::hash::ContentHash;
use crate::note_service::NoteService;
use crate::store::KeyValueStore;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Operations a note client can perform.
///
/// Pushed events for subscribed notes and trees are published on
/// [`NoteApi::events`], never including the client's own edits.
#[async_trait]
pub trait NoteApi: Send + Sync {
    /// Identity the server knows this client by
    fn client_id(&self) -> &str;

    /// Pushed `NoteChanged` / `TreeChanged` events for this client
    fn events(&self) -> &Arc<EventBus>;

    async fn subscribe(&self, id: &str) -> Result<()>;

    async fn unsubscribe(&self, id: &str) -> Result<()>;

    /// Receive `TreeChanged` for the notebook containing `id`
    async fn subscribe_tree(&self, id: &str) -> Result<()>;

    async fn unsubscribe_tree(&self, id: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Result<String>;

    async fn list_tree_ids(&self, id: &str) -> Result<Vec<String>>;

    async fn list_descendant_ids(&self, id: &str) -> Result<Vec<String>>;

    /// Apply `patch` to the stored note; `hash` is the expected result
    async fn save(&self, id: &str, patch: &Patch, hash: ContentHash) -> Result<()>;

    /// Delete `id` and its subtree, returning the ids emptied
    async fn delete(&self, id: &str) -> Result<Vec<String>>;

    /// Move `from` and its subtree to `to`, returning `(from, to)` pairs
    async fn move_note(&self, from: &str, to: &str) -> Result<Vec<(String, String)>>;
}

/// In-process client over a shared `NoteService`.
///
/// Each `LocalApi` is a distinct client with its own id and rooms, so several
/// of them over one service behave like separate connections.
pub struct LocalApi<S> {
    service: Arc<NoteService<S>>,
    client_id: String,
    rooms: Arc<RwLock<HashSet<String>>>,
    events: Arc<EventBus>,
    _forward: Subscription,
}

impl<S: KeyValueStore + 'static> LocalApi<S> {
    pub fn new(service: Arc<NoteService<S>>) -> Self {
        Self::with_client_id(service, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_client_id(service: Arc<NoteService<S>>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let events = Arc::new(EventBus::new());
        let rooms: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));

        let forward = {
            let events = Arc::clone(&events);
            let rooms = Arc::clone(&rooms);
            let me = client_id.clone();
            service.events().subscribe(move |event| {
                let joined = rooms
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains(&event.room());
                if joined && event.is_for(&me) {
                    events.emit(event.clone());
                }
            })
        };

        Self {
            service,
            client_id,
            rooms,
            events,
            _forward: forward,
        }
    }

    pub fn service(&self) -> &Arc<NoteService<S>> {
        &self.service
    }

    fn join(&self, room: String) {
        debug!("Client {} joined {}", self.client_id, room);
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(room);
    }

    fn leave(&self, room: &str) {
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(room);
    }
}

#[async_trait]
impl<S: KeyValueStore + 'static> NoteApi for LocalApi<S> {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    async fn subscribe(&self, id: &str) -> Result<()> {
        self.join(id.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, id: &str) -> Result<()> {
        self.leave(id);
        Ok(())
    }

    async fn subscribe_tree(&self, id: &str) -> Result<()> {
        self.join(tree_room(id));
        Ok(())
    }

    async fn unsubscribe_tree(&self, id: &str) -> Result<()> {
        self.leave(&tree_room(id));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<String> {
        Ok(self.service.get(id).await?)
    }

    async fn list_tree_ids(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.service.list_tree_ids(id).await?)
    }

    async fn list_descendant_ids(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.service.list_descendant_ids(id).await?)
    }

    async fn save(&self, id: &str, patch: &Patch, hash: ContentHash) -> Result<()> {
        Ok(self
            .service
            .apply_patch(id, patch, hash, Some(&self.client_id))
            .await?)
    }

    async fn delete(&self, id: &str) -> Result<Vec<String>> {
        Ok(self
            .service
            .delete_recursively(id, Some(&self.client_id))
            .await?)
    }

    async fn move_note(&self, from: &str, to: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .service
            .move_recursively(from, to, Some(&self.client_id))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff3::create_patch;
    use crate::error::ErrorCode;
    use crate::events::NoteEvent;
    use crate::store::InMemoryStore;
    use std::sync::Mutex;

    fn shared_service() -> Arc<NoteService<InMemoryStore>> {
        Arc::new(NoteService::new(InMemoryStore::new()))
    }

    fn collect(api: &dyn NoteApi) -> (Arc<Mutex<Vec<NoteEvent>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = api
            .events()
            .subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        (seen, sub)
    }

    #[tokio::test]
    async fn test_subscribers_hear_other_clients_only() {
        let service = shared_service();
        let alice = LocalApi::with_client_id(Arc::clone(&service), "alice");
        let bob = LocalApi::with_client_id(Arc::clone(&service), "bob");
        alice.subscribe("nb/doc").await.unwrap();
        bob.subscribe("nb/doc").await.unwrap();

        let (alice_seen, _a) = collect(&alice);
        let (bob_seen, _b) = collect(&bob);

        alice
            .save("nb/doc", &create_patch("", "hi"), ContentHash::of("hi"))
            .await
            .unwrap();

        assert!(alice_seen.lock().unwrap().is_empty());
        let bob_seen = bob_seen.lock().unwrap();
        assert_eq!(bob_seen.len(), 1);
        assert!(matches!(&bob_seen[0], NoteEvent::NoteChanged { id, .. } if id == "nb/doc"));
    }

    #[tokio::test]
    async fn test_unsubscribed_client_hears_nothing() {
        let service = shared_service();
        let alice = LocalApi::new(Arc::clone(&service));
        let bob = LocalApi::new(Arc::clone(&service));
        bob.subscribe("nb/doc").await.unwrap();
        bob.unsubscribe("nb/doc").await.unwrap();
        let (bob_seen, _b) = collect(&bob);

        alice
            .save("nb/doc", &create_patch("", "hi"), ContentHash::of("hi"))
            .await
            .unwrap();
        assert!(bob_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tree_subscribers_hear_existence_changes() {
        let service = shared_service();
        let alice = LocalApi::new(Arc::clone(&service));
        alice.subscribe_tree("nb/anything").await.unwrap();
        let (seen, _s) = collect(&alice);

        alice
            .save("nb/new", &create_patch("", "x"), ContentHash::of("x"))
            .await
            .unwrap();
        alice.delete("nb/new").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                NoteEvent::TreeChanged {
                    root_id: "nb".into()
                };
                2
            ]
        );
    }

    #[tokio::test]
    async fn test_errors_carry_codes() {
        let service = shared_service();
        let api = LocalApi::new(service);
        let err = api.move_note("ghost", "dst").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoteNotFound);
        assert_eq!(err.to_string(), "Note is empty.");
    }
}
