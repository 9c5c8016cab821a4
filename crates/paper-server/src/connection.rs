//! Individual client connection management.
//!
//! Each connection splits its WebSocket into a read task, which serves calls
//! one at a time through the dispatcher, and a write task, which drains the
//! client's outlet. Replies and pushed events share the outlet, so a client
//! sees them in the order the server produced them.

use futures::{SinkExt, StreamExt};
use paper_core::protocol::MAX_MESSAGE_SIZE;
use paper_core::KeyValueStore;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::dispatch::Dispatcher;
use crate::rooms::Outlet;

/// Event emitted by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Connection was closed
    Closed { client_id: String },
}

/// A single WebSocket connection to a client.
pub struct ClientConnection {
    pub client_id: String,
    outlet: Outlet,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Wrap an accepted WebSocket stream and start its read and write tasks.
    pub fn new<S: KeyValueStore + 'static>(
        client_id: String,
        ws_stream: WebSocketStream<TcpStream>,
        dispatcher: Arc<Dispatcher<S>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let (outlet, frames) = mpsc::unbounded_channel();

        let write_task = tokio::spawn(Self::write_loop(client_id.clone(), write, frames));
        let read_task = tokio::spawn(Self::read_loop(
            client_id.clone(),
            read,
            dispatcher,
            event_tx,
        ));

        Self {
            client_id,
            outlet,
            read_task: Some(read_task),
            write_task: Some(write_task),
        }
    }

    /// Queue for frames to this client.
    pub fn outlet(&self) -> Outlet {
        self.outlet.clone()
    }

    async fn read_loop<S: KeyValueStore + 'static>(
        client_id: String,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        dispatcher: Arc<Dispatcher<S>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", client_id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            client_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    if let Some(reply) = dispatcher.handle_frame(&client_id, &data).await {
                        if !dispatcher.rooms().send_to(&client_id, &reply) {
                            debug!("Client {} went away before its reply", client_id);
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", client_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", client_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", client_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { client_id });
    }

    async fn write_loop(
        client_id: String,
        mut write: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        mut frames: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = write.send(Message::text(frame)).await {
                debug!("Failed to send to {}: {}", client_id, e);
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    }

    /// Stop both tasks.
    pub fn close(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.close();
    }
}
