//! Request dispatch: maps decoded calls onto the note service and rooms.

use paper_core::events::tree_room;
use paper_core::protocol::{decode, ClientMessage, Request, ServerMessage};
use paper_core::{ApiError, ErrorCode, KeyValueStore, NoteError, NoteService};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::rooms::Rooms;

/// Serves calls for every connection against one shared note service.
pub struct Dispatcher<S> {
    service: Arc<NoteService<S>>,
    rooms: Arc<Rooms>,
}

impl<S: KeyValueStore> Dispatcher<S> {
    pub fn new(service: Arc<NoteService<S>>, rooms: Arc<Rooms>) -> Self {
        Self { service, rooms }
    }

    pub fn service(&self) -> &Arc<NoteService<S>> {
        &self.service
    }

    pub fn rooms(&self) -> &Arc<Rooms> {
        &self.rooms
    }

    /// Handle one incoming frame. Returns the reply, or `None` for frames
    /// that are not calls at all.
    pub async fn handle_frame(&self, client_id: &str, data: &[u8]) -> Option<ServerMessage> {
        let message: ClientMessage = match decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", client_id, e);
                return None;
            }
        };

        let seq = message.seq();
        let reply = match message.request() {
            Ok(request) => self.call(client_id, request).await,
            Err(e) => {
                warn!("Bad call from {}: {}", client_id, e);
                Err(ApiError::from(ErrorCode::Unknown))
            }
        };

        Some(match reply {
            Ok(value) => ServerMessage::reply_ok(seq, value),
            Err(err) => ServerMessage::reply_err(seq, &err),
        })
    }

    /// Execute a typed request on behalf of `client_id`.
    pub async fn call(&self, client_id: &str, request: Request) -> Result<Value, ApiError> {
        debug!("{} called {}", client_id, request.method());
        let origin = Some(client_id);

        let result = match request {
            Request::Subscribe { id } => {
                self.rooms.join(client_id, &id);
                Ok(Value::Null)
            }
            Request::Unsubscribe { id } => {
                self.rooms.leave(client_id, &id);
                Ok(Value::Null)
            }
            Request::SubscribeTree { root_id } => {
                self.rooms.join(client_id, &tree_room(&root_id));
                Ok(Value::Null)
            }
            Request::UnsubscribeTree { root_id } => {
                self.rooms.leave(client_id, &tree_room(&root_id));
                Ok(Value::Null)
            }
            Request::Get { id } => self.service.get(&id).await.map(Value::String),
            Request::ListTreeIds { id } => self.service.list_tree_ids(&id).await.map(|ids| json!(ids)),
            Request::ListDescendantIds { id } => self
                .service
                .list_descendant_ids(&id)
                .await
                .map(|ids| json!(ids)),
            Request::Save { id, patch, hash } => self
                .service
                .apply_patch(&id, &patch, hash, origin)
                .await
                .map(|()| Value::Null),
            Request::Delete { id } => self
                .service
                .delete_recursively(&id, origin)
                .await
                .map(|ids| json!(ids)),
            Request::Move { from, to } => self
                .service
                .move_recursively(&from, &to, origin)
                .await
                .map(|moved| json!(moved)),
        };

        result.map_err(|err| {
            match &err {
                NoteError::Store(e) => error!("Store failure serving {}: {}", client_id, e),
                other => debug!("Rejected call from {}: {}", client_id, other),
            }
            ApiError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paper_core::protocol::encode;
    use paper_core::{create_patch, ContentHash, InMemoryStore};

    fn dispatcher() -> Dispatcher<InMemoryStore> {
        Dispatcher::new(
            Arc::new(NoteService::new(InMemoryStore::new())),
            Arc::new(Rooms::new()),
        )
    }

    async fn frame(d: &Dispatcher<InMemoryStore>, seq: u64, request: Request) -> ServerMessage {
        let call = ClientMessage::call(seq, &request).unwrap();
        d.handle_frame("c1", encode(&call).unwrap().as_bytes())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_then_get() {
        let d = dispatcher();
        let reply = frame(
            &d,
            1,
            Request::Save {
                id: "nb/a".into(),
                patch: create_patch("", "text"),
                hash: ContentHash::of("text"),
            },
        )
        .await;
        assert_eq!(reply, ServerMessage::reply_ok(1, Value::Null));

        let reply = frame(&d, 2, Request::Get { id: "nb/a".into() }).await;
        assert_eq!(reply, ServerMessage::reply_ok(2, json!("text")));
    }

    #[tokio::test]
    async fn test_errors_become_coded_replies() {
        let d = dispatcher();
        let reply = frame(
            &d,
            5,
            Request::Move {
                from: "a".into(),
                to: "a/b".into(),
            },
        )
        .await;
        match reply {
            ServerMessage::Reply { seq, error: Some(body), .. } => {
                assert_eq!(seq, 5);
                assert_eq!(body.code, ErrorCode::InvalidOperation);
                assert_eq!(body.message, "Cannot move a note to its own descendant path.");
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_move_reply_lists_pairs() {
        let d = dispatcher();
        d.service().set_content("src", "s", None).await.unwrap();
        let reply = frame(
            &d,
            1,
            Request::Move {
                from: "src".into(),
                to: "dst".into(),
            },
        )
        .await;
        assert_eq!(reply, ServerMessage::reply_ok(1, json!([["src", "dst"]])));
    }

    #[tokio::test]
    async fn test_subscribe_joins_rooms() {
        let d = dispatcher();
        frame(&d, 1, Request::Subscribe { id: "nb/a".into() }).await;
        frame(&d, 2, Request::SubscribeTree { root_id: "nb".into() }).await;
        assert_eq!(d.rooms().members("nb/a"), vec!["c1"]);
        assert_eq!(d.rooms().members("nb/"), vec!["c1"]);

        frame(&d, 3, Request::UnsubscribeTree { root_id: "nb".into() }).await;
        assert!(d.rooms().members("nb/").is_empty());
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_methods() {
        let d = dispatcher();
        assert!(d.handle_frame("c1", b"not json").await.is_none());

        let raw = br#"{"type":"call","seq":4,"method":"nope","params":null}"#;
        match d.handle_frame("c1", raw).await {
            Some(ServerMessage::Reply { seq: 4, error: Some(body), .. }) => {
                assert_eq!(body.code, ErrorCode::Unknown)
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
