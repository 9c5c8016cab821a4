//! paper-client: Talks to a paper-server and keeps open documents in sync.
//!
//! - `connection` - `RpcClient`, the `NoteApi` over WebSocket
//! - `session` - `DocumentSession`, a `Reconciler` driven by real timers

pub mod connection;
pub mod session;

pub use connection::RpcClient;
pub use session::{DocumentSession, SessionHandle, SessionInput, SessionUpdate};
