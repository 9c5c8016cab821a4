//! WebSocket RPC connection to a paper-server.
//!
//! Calls are tagged with a sequence number and resolved when the matching
//! reply arrives. Pushed events are published on the client's event bus in
//! the order they were received.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use paper_core::api::{self, NoteApi};
use paper_core::protocol::{decode, encode, ClientMessage, Request, ServerMessage, MAX_MESSAGE_SIZE};
use paper_core::{ApiError, ContentHash, EventBus, Patch};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<api::Result<Value>>>>>;

/// How long to wait for the server greeting and for each reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected note client speaking the JSON protocol.
pub struct RpcClient {
    client_id: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_seq: AtomicU64,
    events: Arc<EventBus>,
    call_timeout: Duration,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl RpcClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:3000`) and wait for the greeting.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_timeout(url, DEFAULT_CALL_TIMEOUT).await
    }

    pub async fn connect_with_timeout(url: &str, call_timeout: Duration) -> Result<Self> {
        let (ws, _) = timeout(call_timeout, connect_async(url))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", url))?
            .with_context(|| format!("Failed to connect to {}", url))?;
        let (write, mut read) = ws.split();

        let client_id = timeout(call_timeout, Self::expect_hello(&mut read))
            .await
            .map_err(|_| anyhow!("Timed out waiting for server greeting"))??;
        info!("Connected to {} as {}", url, client_id);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let events = Arc::new(EventBus::new());
        let (outgoing, frames) = mpsc::unbounded_channel();

        let write_task = tokio::spawn(Self::write_loop(write, frames));
        let read_task = tokio::spawn(Self::read_loop(
            read,
            Arc::clone(&pending),
            Arc::clone(&events),
        ));

        Ok(Self {
            client_id,
            outgoing,
            pending,
            next_seq: AtomicU64::new(1),
            events,
            call_timeout,
            read_task: Some(read_task),
            write_task: Some(write_task),
        })
    }

    async fn expect_hello(read: &mut futures::stream::SplitStream<WsStream>) -> Result<String> {
        while let Some(msg) = read.next().await {
            let data = match msg? {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(data) => data.to_vec(),
                Message::Close(_) => break,
                _ => continue,
            };
            return match decode::<ServerMessage>(&data)? {
                ServerMessage::Hello { client_id } => Ok(client_id),
                other => Err(anyhow!("Expected hello, got {:?}", other)),
            };
        }
        Err(anyhow!("Connection closed before greeting"))
    }

    async fn read_loop(
        mut read: futures::stream::SplitStream<WsStream>,
        pending: Pending,
        events: Arc<EventBus>,
    ) {
        loop {
            let data = match read.next().await {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Server closed the connection");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("Connection stream ended");
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            };

            if data.len() > MAX_MESSAGE_SIZE {
                warn!("Message exceeds max size ({} > {}), dropping", data.len(), MAX_MESSAGE_SIZE);
                continue;
            }

            let message = match decode::<ServerMessage>(&data) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping malformed frame: {}", e);
                    continue;
                }
            };

            match message {
                ServerMessage::Reply { seq, ok, error } => {
                    let waiter = pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&seq);
                    let result = match error {
                        Some(body) => Err(ApiError::from(body)),
                        None => Ok(ok.unwrap_or(Value::Null)),
                    };
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(result);
                        }
                        None => debug!("Reply for unknown call {}", seq),
                    }
                }
                ServerMessage::Hello { .. } => debug!("Ignoring repeated greeting"),
                pushed => {
                    if let Some(event) = pushed.into_event() {
                        events.emit(event);
                    }
                }
            }
        }

        // Fail every call still waiting
        let waiters: Vec<_> = pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(ApiError::Transport("connection closed".into())));
        }
    }

    async fn write_loop(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut frames: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = write.send(frame).await {
                debug!("Failed to send frame: {}", e);
                break;
            }
        }
    }

    /// Send a request and wait for its reply.
    pub async fn call(&self, request: Request) -> api::Result<Value> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame = ClientMessage::call(seq, &request)
            .and_then(|call| encode(&call))
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(seq, tx);

        if self.outgoing.send(Message::text(frame)).is_err() {
            self.forget(seq);
            return Err(ApiError::Transport("connection closed".into()));
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ApiError::Transport("connection closed".into())),
            Err(_) => {
                self.forget(seq);
                Err(ApiError::Transport(format!("{} timed out", request.method())))
            }
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, request: Request) -> api::Result<T> {
        let value = self.call(request).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Transport(format!("bad reply: {}", e)))
    }

    fn forget(&self, seq: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&seq);
    }

    /// Close the connection.
    pub async fn close(&mut self) {
        let _ = self.outgoing.send(Message::Close(None));
        if let Some(task) = self.write_task.take() {
            let _ = timeout(Duration::from_secs(1), task).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl NoteApi for RpcClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    async fn subscribe(&self, id: &str) -> api::Result<()> {
        self.call(Request::Subscribe { id: id.to_string() }).await?;
        Ok(())
    }

    async fn unsubscribe(&self, id: &str) -> api::Result<()> {
        self.call(Request::Unsubscribe { id: id.to_string() }).await?;
        Ok(())
    }

    async fn subscribe_tree(&self, id: &str) -> api::Result<()> {
        self.call(Request::SubscribeTree {
            root_id: id.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn unsubscribe_tree(&self, id: &str) -> api::Result<()> {
        self.call(Request::UnsubscribeTree {
            root_id: id.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> api::Result<String> {
        self.call_as(Request::Get { id: id.to_string() }).await
    }

    async fn list_tree_ids(&self, id: &str) -> api::Result<Vec<String>> {
        self.call_as(Request::ListTreeIds { id: id.to_string() }).await
    }

    async fn list_descendant_ids(&self, id: &str) -> api::Result<Vec<String>> {
        self.call_as(Request::ListDescendantIds { id: id.to_string() })
            .await
    }

    async fn save(&self, id: &str, patch: &Patch, hash: ContentHash) -> api::Result<()> {
        self.call(Request::Save {
            id: id.to_string(),
            patch: patch.clone(),
            hash,
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> api::Result<Vec<String>> {
        self.call_as(Request::Delete { id: id.to_string() }).await
    }

    async fn move_note(&self, from: &str, to: &str) -> api::Result<Vec<(String, String)>> {
        self.call_as(Request::Move {
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
    }
}
