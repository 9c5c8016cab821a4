//! WebSocket server accepting note clients.
//!
//! Owns the connections, the shared dispatcher and the subscription that fans
//! store events out to room members.

use anyhow::Result;
use paper_core::protocol::ServerMessage;
use paper_core::{KeyValueStore, NoteService, Subscription};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

use crate::connection::{ClientConnection, ConnectionEvent};
use crate::dispatch::Dispatcher;
use crate::rooms::Rooms;

/// WebSocket server managing client connections.
pub struct WebSocketServer<S> {
    dispatcher: Arc<Dispatcher<S>>,
    connections: HashMap<String, ClientConnection>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    _fan_out: Subscription,
}

impl<S: KeyValueStore + 'static> WebSocketServer<S> {
    /// Create a server over `service`. Store events start flowing to
    /// subscribed clients immediately.
    pub fn new(service: Arc<NoteService<S>>) -> Self {
        let rooms = Arc::new(Rooms::new());
        let fan_out = {
            let rooms = Arc::clone(&rooms);
            service.events().subscribe(move |event| {
                rooms.publish(event);
            })
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            dispatcher: Arc::new(Dispatcher::new(service, rooms)),
            connections: HashMap::new(),
            event_tx,
            event_rx,
            _fan_out: fan_out,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub fn rooms(&self) -> &Arc<Rooms> {
        self.dispatcher.rooms()
    }

    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    /// Upgrade a TCP connection to WebSocket and greet the client.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without a handshake
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let client_id = uuid::Uuid::new_v4().to_string();
        info!("New connection from {} (client_id: {})", addr, client_id);

        let conn = ClientConnection::new(
            client_id.clone(),
            ws_stream,
            Arc::clone(&self.dispatcher),
            self.event_tx.clone(),
        );
        self.rooms().register(&client_id, conn.outlet());
        self.rooms().send_to(
            &client_id,
            &ServerMessage::Hello {
                client_id: client_id.clone(),
            },
        );
        self.connections.insert(client_id, conn);
    }

    /// Wait for the next connection event.
    pub async fn recv_event(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    pub fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Closed { client_id } => {
                self.rooms().unregister(&client_id);
                if let Some(mut conn) = self.connections.remove(&client_id) {
                    conn.close();
                }
                info!("Client disconnected: {}", client_id);
            }
        }
    }

    /// Accept and serve clients until `shutdown` resolves.
    pub async fn run(mut self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some(event) = self.recv_event() => {
                    self.on_connection_event(event);
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        for (_, mut conn) in self.connections.drain() {
            conn.close();
        }
    }
}
