//! Content hash used for optimistic concurrency checks.
//!
//! Same function as the `string-hash` package the browser clients ship with,
//! so hashes computed on either side compare equal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-bit non-cryptographic hash of a note's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub u32);

impl ContentHash {
    /// Hash `text` over its UTF-16 code units, last to first.
    pub fn of(text: &str) -> Self {
        let units: Vec<u16> = text.encode_utf16().collect();
        let hash = units
            .iter()
            .rev()
            .fold(5381u32, |h, unit| h.wrapping_mul(33) ^ u32::from(*unit));
        Self(hash)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Length of `text` in UTF-16 code units, the unit note size limits use.
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}
