//! End-to-end tests: a real server on a loopback port, real WebSocket clients.

use paper_client::{DocumentSession, RpcClient, SessionHandle, SessionUpdate};
use paper_core::api::NoteApi;
use paper_core::{
    create_patch, ContentHash, ErrorCode, InMemoryStore, NoteEvent, NoteService, ReconcileConfig,
    Selection,
};
use paper_server::WebSocketServer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

struct TestServer {
    url: String,
    service: Arc<NoteService<InMemoryStore>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server() -> TestServer {
    start_server_with(NoteService::new(InMemoryStore::new())).await
}

async fn start_server_with(service: NoteService<InMemoryStore>) -> TestServer {
    let service = Arc::new(service);
    let listener = WebSocketServer::<InMemoryStore>::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = WebSocketServer::new(Arc::clone(&service));
    let (tx, rx) = oneshot::channel();
    tokio::spawn(server.run(listener, async {
        let _ = rx.await;
    }));
    TestServer {
        url,
        service,
        shutdown: Some(tx),
    }
}

fn record(client: &RpcClient) -> (Arc<Mutex<Vec<NoteEvent>>>, paper_core::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = client
        .events()
        .subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    (seen, sub)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn wait_for_text(session: &mut SessionHandle, expected: &str) {
    timeout(Duration::from_secs(5), async {
        loop {
            match session.next_update().await {
                Some(SessionUpdate::Content { text, .. }) if text == expected => return,
                Some(_) => {}
                None => panic!("session stopped before showing {:?}", expected),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected));
}

#[tokio::test]
async fn test_clients_get_distinct_ids() {
    let server = start_server().await;
    let a = RpcClient::connect(&server.url).await.unwrap();
    let b = RpcClient::connect(&server.url).await.unwrap();
    assert!(!a.client_id().is_empty());
    assert_ne!(a.client_id(), b.client_id());
}

#[tokio::test]
async fn test_save_and_get() {
    let server = start_server().await;
    let client = RpcClient::connect(&server.url).await.unwrap();

    assert_eq!(client.get("nb/doc").await.unwrap(), "");
    client
        .save("nb/doc", &create_patch("", "Hello"), ContentHash::of("Hello"))
        .await
        .unwrap();
    assert_eq!(client.get("nb/doc").await.unwrap(), "Hello");
    assert_eq!(server.service.get("nb/doc").await.unwrap(), "Hello");
}

#[tokio::test]
async fn test_subscriber_hears_other_client_but_not_itself() {
    let server = start_server().await;
    let alice = RpcClient::connect(&server.url).await.unwrap();
    let bob = RpcClient::connect(&server.url).await.unwrap();
    alice.subscribe("nb/doc").await.unwrap();
    bob.subscribe("nb/doc").await.unwrap();
    let (alice_seen, _a) = record(&alice);
    let (bob_seen, _b) = record(&bob);

    let patch = create_patch("", "Hello from user 1");
    alice
        .save("nb/doc", &patch, ContentHash::of("Hello from user 1"))
        .await
        .unwrap();

    wait_until(|| !bob_seen.lock().unwrap().is_empty()).await;
    assert_eq!(
        bob_seen.lock().unwrap()[0],
        NoteEvent::NoteChanged {
            id: "nb/doc".into(),
            hash: ContentHash::of("Hello from user 1"),
            patch,
            origin: None,
        }
    );

    // A round trip on alice's connection flushes anything queued before it
    alice.get("nb/doc").await.unwrap();
    assert!(alice_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_save_is_rejected() {
    let server = start_server().await;
    server.service.set_content("nb/doc", "Hello world", None).await.unwrap();
    let client = RpcClient::connect(&server.url).await.unwrap();

    // Built against content the server no longer has
    let err = client
        .save("nb/doc", &create_patch("Hello", "Hello!"), ContentHash::of("Hello!"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::HashMismatch);
    assert_eq!(server.service.get("nb/doc").await.unwrap(), "Hello world");
}

#[tokio::test]
async fn test_oversized_save_is_rejected() {
    let server = start_server_with(NoteService::new(InMemoryStore::new()).with_max_size(5)).await;
    let client = RpcClient::connect(&server.url).await.unwrap();

    let err = client
        .save("nb/doc", &create_patch("", "too long"), ContentHash::of("too long"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ExceededMaxSize);
    assert_eq!(
        err.to_string(),
        "Note's size exceeded limit (100,000 characters)."
    );
}

#[tokio::test]
async fn test_tree_operations_and_errors() {
    let server = start_server().await;
    for (id, text) in [("nb", "root"), ("nb/a", "a"), ("nb/a/b", "b"), ("nb/c", "c")] {
        server.service.set_content(id, text, None).await.unwrap();
    }
    let client = RpcClient::connect(&server.url).await.unwrap();

    assert_eq!(
        client.list_tree_ids("nb/c").await.unwrap(),
        vec!["nb", "nb/a", "nb/a/b", "nb/c"]
    );
    assert_eq!(
        client.list_descendant_ids("nb/a").await.unwrap(),
        vec!["nb/a/b"]
    );

    let err = client.move_note("nb/a", "nb/a/b/x").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOperation);

    let err = client.move_note("nb/a", "nb/c").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TargetAlreadyExists);

    let err = client.move_note("nb/ghost", "nb/d").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoteNotFound);

    let moved = client.move_note("nb/a", "nb/d").await.unwrap();
    assert_eq!(
        moved,
        vec![
            ("nb/a".to_string(), "nb/d".to_string()),
            ("nb/a/b".to_string(), "nb/d/b".to_string()),
        ]
    );
    assert_eq!(client.get("nb/d/b").await.unwrap(), "b");
    assert_eq!(client.get("nb/a/b").await.unwrap(), "");

    let deleted = client.delete("nb/d").await.unwrap();
    assert_eq!(deleted, vec!["nb/d", "nb/d/b"]);
    assert_eq!(
        client.list_tree_ids("nb").await.unwrap(),
        vec!["nb", "nb/c"]
    );
}

#[tokio::test]
async fn test_tree_subscribers_hear_creation() {
    let server = start_server().await;
    let watcher = RpcClient::connect(&server.url).await.unwrap();
    let writer = RpcClient::connect(&server.url).await.unwrap();
    watcher.subscribe_tree("nb/anything").await.unwrap();
    let (seen, _s) = record(&watcher);

    writer
        .save("nb/new", &create_patch("", "x"), ContentHash::of("x"))
        .await
        .unwrap();

    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(
        seen.lock().unwrap()[0],
        NoteEvent::TreeChanged {
            root_id: "nb".into()
        }
    );
}

#[tokio::test]
async fn test_sessions_converge_over_the_network() {
    let server = start_server().await;
    server.service.set_content("nb/doc", "Hello world", None).await.unwrap();

    let config = ReconcileConfig {
        debounce: Duration::from_millis(20),
        ..ReconcileConfig::default()
    };
    let alice = Arc::new(RpcClient::connect(&server.url).await.unwrap());
    let bob = Arc::new(RpcClient::connect(&server.url).await.unwrap());
    let mut alice_session = DocumentSession::spawn(alice, "nb/doc", config);
    let mut bob_session = DocumentSession::spawn(bob, "nb/doc", config);
    wait_for_text(&mut alice_session, "Hello world").await;
    wait_for_text(&mut bob_session, "Hello world").await;

    alice_session.edit("Hello world", "Hello brave world", Selection::caret(12));
    bob_session.edit("Hello world", "Hello world!", Selection::caret(12));

    wait_for_text(&mut bob_session, "Hello brave world!").await;
    alice_session.close().await.unwrap();
    let bob_state = bob_session.close().await.unwrap();

    assert!(!bob_state.has_unsaved_changes());
    assert_eq!(
        server.service.get("nb/doc").await.unwrap(),
        "Hello brave world!"
    );
}
