//! Error taxonomy shared by the store, the API seam and the wire protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Stable error codes reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    HashMismatch,
    ExceededMaxSize,
    NoteNotFound,
    TargetAlreadyExists,
    InvalidOperation,
}

impl ErrorCode {
    /// Numeric code, for clients that still switch on numbers.
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Unknown => 10000,
            ErrorCode::HashMismatch => 10001,
            ErrorCode::ExceededMaxSize => 10002,
            ErrorCode::NoteNotFound => 10003,
            ErrorCode::TargetAlreadyExists => 10004,
            ErrorCode::InvalidOperation => 10005,
        }
    }

    /// User-facing message.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Unknown | ErrorCode::HashMismatch => {
                "Something went wrong. Please refresh page and try again."
            }
            ErrorCode::ExceededMaxSize => "Note's size exceeded limit (100,000 characters).",
            ErrorCode::NoteNotFound => "Note is empty.",
            ErrorCode::TargetAlreadyExists => "Target location already exists.",
            ErrorCode::InvalidOperation => "Cannot move a note to its own descendant path.",
        }
    }
}

/// Failure of a note store operation.
#[derive(Debug, Error)]
pub enum NoteError {
    #[error("hash mismatch for note {0}")]
    HashMismatch(String),

    #[error("note {id} would be {len} units long, limit is {max}")]
    ExceededMaxSize { id: String, len: usize, max: usize },

    #[error("nothing to move at {0}")]
    NoteNotFound(String),

    #[error("target already exists: {0}")]
    TargetAlreadyExists(String),

    #[error("cannot move {from} into its own subtree {to}")]
    InvalidOperation { from: String, to: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl NoteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NoteError::HashMismatch(_) => ErrorCode::HashMismatch,
            NoteError::ExceededMaxSize { .. } => ErrorCode::ExceededMaxSize,
            NoteError::NoteNotFound(_) => ErrorCode::NoteNotFound,
            NoteError::TargetAlreadyExists(_) => ErrorCode::TargetAlreadyExists,
            NoteError::InvalidOperation { .. } => ErrorCode::InvalidOperation,
            NoteError::Store(_) => ErrorCode::Unknown,
        }
    }
}

/// Failure of a [`NoteApi`](crate::api::NoteApi) call as seen by a client.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The server processed the call and refused it.
    #[error("{message}")]
    Rejected { code: ErrorCode, message: String },

    /// The call never got an answer (connection lost, timeout, bad frame).
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Rejected { code, .. } => *code,
            ApiError::Transport(_) => ErrorCode::Unknown,
        }
    }
}

impl From<ErrorCode> for ApiError {
    fn from(code: ErrorCode) -> Self {
        ApiError::Rejected {
            code,
            message: code.message().to_string(),
        }
    }
}

impl From<NoteError> for ApiError {
    fn from(err: NoteError) -> Self {
        ApiError::from(err.code())
    }
}
