//! Wire protocol between note clients and the server.
//!
//! One JSON object per WebSocket frame. The server greets each connection with
//! `hello`, answers every `call` with a `reply` carrying the same `seq`, and
//! pushes `noteChanged` / `treeChanged` events for subscribed rooms.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::diff3::Patch;
use crate::error::{ApiError, ErrorCode};
use crate::events::NoteEvent;
use crate::hash::ContentHash;

/// Maximum frame size (50MB); larger frames are dropped.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Operations a client can call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    Subscribe {
        id: String,
    },
    Unsubscribe {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    SubscribeTree {
        root_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UnsubscribeTree {
        root_id: String,
    },
    Get {
        id: String,
    },
    ListTreeIds {
        id: String,
    },
    ListDescendantIds {
        id: String,
    },
    Save {
        id: String,
        patch: Patch,
        hash: ContentHash,
    },
    Delete {
        id: String,
    },
    Move {
        from: String,
        to: String,
    },
}

impl Request {
    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::SubscribeTree { .. } => "subscribeTree",
            Request::UnsubscribeTree { .. } => "unsubscribeTree",
            Request::Get { .. } => "get",
            Request::ListTreeIds { .. } => "listTreeIds",
            Request::ListDescendantIds { .. } => "listDescendantIds",
            Request::Save { .. } => "save",
            Request::Delete { .. } => "delete",
            Request::Move { .. } => "move",
        }
    }
}

/// Client -> server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Call {
        seq: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
}

impl ClientMessage {
    pub fn call(seq: u64, request: &Request) -> serde_json::Result<Self> {
        let mut value = serde_json::to_value(request)?;
        let params = value
            .get_mut("params")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(ClientMessage::Call {
            seq,
            method: request.method().to_string(),
            params,
        })
    }

    pub fn seq(&self) -> u64 {
        match self {
            ClientMessage::Call { seq, .. } => *seq,
        }
    }

    /// Decode the typed request carried by a call.
    pub fn request(&self) -> serde_json::Result<Request> {
        match self {
            ClientMessage::Call { method, params, .. } => {
                serde_json::from_value(json!({ "method": method, "params": params }))
            }
        }
    }
}

/// Error payload of a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&ApiError> for ErrorBody {
    fn from(err: &ApiError) -> Self {
        match err {
            ApiError::Rejected { code, message } => ErrorBody {
                code: *code,
                message: message.clone(),
            },
            ApiError::Transport(_) => ErrorBody {
                code: ErrorCode::Unknown,
                message: ErrorCode::Unknown.message().to_string(),
            },
        }
    }
}

impl From<ErrorBody> for ApiError {
    fn from(body: ErrorBody) -> Self {
        ApiError::Rejected {
            code: body.code,
            message: body.message,
        }
    }
}

/// Server -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Hello { client_id: String },

    Reply {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    NoteChanged {
        id: String,
        hash: ContentHash,
        patch: Patch,
    },

    #[serde(rename_all = "camelCase")]
    TreeChanged { root_id: String },
}

impl ServerMessage {
    pub fn reply_ok(seq: u64, value: Value) -> Self {
        ServerMessage::Reply {
            seq,
            ok: Some(value),
            error: None,
        }
    }

    pub fn reply_err(seq: u64, err: &ApiError) -> Self {
        ServerMessage::Reply {
            seq,
            ok: None,
            error: Some(err.into()),
        }
    }

    /// Convert a store event into the message pushed to subscribers.
    pub fn from_event(event: &NoteEvent) -> Self {
        match event {
            NoteEvent::NoteChanged {
                id, hash, patch, ..
            } => ServerMessage::NoteChanged {
                id: id.clone(),
                hash: *hash,
                patch: patch.clone(),
            },
            NoteEvent::TreeChanged { root_id } => ServerMessage::TreeChanged {
                root_id: root_id.clone(),
            },
        }
    }

    /// The pushed event this message carries, if it is one.
    pub fn into_event(self) -> Option<NoteEvent> {
        match self {
            ServerMessage::NoteChanged { id, hash, patch } => Some(NoteEvent::NoteChanged {
                id,
                hash,
                patch,
                origin: None,
            }),
            ServerMessage::TreeChanged { root_id } => Some(NoteEvent::TreeChanged { root_id }),
            ServerMessage::Hello { .. } | ServerMessage::Reply { .. } => None,
        }
    }
}

/// Serialize a message to the JSON text sent in one frame.
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

/// Parse one frame's payload.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(data)
}
