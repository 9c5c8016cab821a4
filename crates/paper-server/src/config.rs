//! Server configuration: an optional JSON file, overridden by CLI flags.

use std::path::{Path, PathBuf};

use clap::Parser;
use paper_core::DEFAULT_MAX_NOTE_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Parser, Debug, Default)]
#[command(name = "paper-server")]
#[command(about = "1paper note sync server")]
pub struct Args {
    /// Path to a JSON config file
    #[arg(short, long, env = "PAPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on for WebSocket connections
    #[arg(short, long, env = "PAPER_LISTEN")]
    pub listen: Option<String>,

    /// Directory to store notes in (in-memory if not set)
    #[arg(short, long, env = "PAPER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Maximum note length in UTF-16 code units
    #[arg(long, env = "PAPER_MAX_NOTE_SIZE")]
    pub max_note_size: Option<usize>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Effective server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Note directory; notes live in memory when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Maximum note length in UTF-16 code units
    #[serde(default = "default_max_note_size")]
    pub max_note_size: usize,
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_max_note_size() -> usize {
    DEFAULT_MAX_NOTE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: None,
            max_note_size: default_max_note_size(),
        }
    }
}

impl Config {
    /// Load a config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Build the effective configuration: file (if any), then CLI overrides.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(listen) = &args.listen {
            config.listen = listen.clone();
        }
        if let Some(dir) = &args.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(max) = args.max_note_size {
            config.max_note_size = max;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_note_size == 0 {
            return Err(ConfigError::Invalid("maxNoteSize must be positive".into()));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("listen address is empty".into()));
        }
        Ok(())
    }
}
