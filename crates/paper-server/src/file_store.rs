//! File-backed note store using tokio::fs.
//!
//! One file per note in a flat directory. File names are the url-encoded
//! note id plus `.txt`, so slashes in ids never create subdirectories.

use async_trait::async_trait;
use paper_core::store::{KeyValueStore, Result, StoreError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const EXTENSION: &str = ".txt";
const TEMP_PREFIX: &str = ".tmp-";
/// Longest file name most filesystems accept, in bytes
const MAX_FILE_NAME: usize = 255;

/// Note store persisting each note as a file
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_path`.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// File name for `key`. Ids whose temp file name would not fit the
    /// platform limit are rejected.
    fn file_name(key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let name = format!("{}{}", urlencoding::encode(key), EXTENSION);
        if TEMP_PREFIX.len() + name.len() > MAX_FILE_NAME {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(name)
    }

    fn key_of(file_name: &str) -> Option<String> {
        let encoded = file_name.strip_suffix(EXTENSION)?;
        if encoded.starts_with(TEMP_PREFIX) {
            return None;
        }
        urlencoding::decode(encoded).ok().map(|key| key.into_owned())
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.base_path.join(Self::file_name(key)?))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let full_path = self.full_path(key)?;
        match fs::read(&full_path).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::Corrupt(key.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        let temp_path = self
            .base_path
            .join(format!("{}{}", TEMP_PREFIX, Self::file_name(key)?));

        // Temp file first, then rename over the note
        fs::write(&temp_path, value.as_bytes())
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dir = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            match Self::key_of(&name) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => {
                    if !name.starts_with(TEMP_PREFIX) {
                        warn!("Ignoring unexpected file in note directory: {}", name);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
