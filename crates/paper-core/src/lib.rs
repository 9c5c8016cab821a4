//! paper-core: Document synchronization engine for 1paper notes.
//!
//! This crate provides:
//! - Text diff, patch and three-way merge (`diff3`)
//! - The server-side note store with optimistic concurrency (`note_service`)
//! - The client-side reconciliation state machine (`reconcile`)
//! - KeyValueStore and NoteApi trait abstractions
//! - The JSON wire protocol shared by server and client

pub mod api;
pub mod diff3;
pub mod error;
pub mod events;
pub mod hash;
pub mod note_service;
pub mod path;
pub mod protocol;
pub mod reconcile;
pub mod store;

pub use api::{LocalApi, NoteApi};
pub use diff3::{apply_patch, create_patch, merge3, Hunk, Patch, Selection};
pub use error::{ApiError, ErrorCode, NoteError};
pub use events::{EventBus, NoteEvent, Subscription};
pub use hash::ContentHash;
pub use note_service::{NoteService, DEFAULT_MAX_NOTE_SIZE};
pub use protocol::{ClientMessage, Request, ServerMessage};
pub use reconcile::{Action, ReconcileConfig, Reconciler};
pub use store::{InMemoryStore, KeyValueStore, StoreError};
