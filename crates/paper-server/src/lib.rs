//! paper-server library: Exposes the server components for the binary and
//! for integration tests.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod file_store;
pub mod rooms;
pub mod server;

pub use config::{Args, Config, ConfigError};
pub use connection::{ClientConnection, ConnectionEvent};
pub use dispatch::Dispatcher;
pub use file_store::FileStore;
pub use rooms::Rooms;
pub use server::WebSocketServer;
