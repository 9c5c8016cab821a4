//! paper-server: Hosts the 1paper note store over WebSocket.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use paper_core::{InMemoryStore, KeyValueStore, NoteService};
use paper_server::{Args, Config, FileStore, WebSocketServer};

async fn serve<S: KeyValueStore + 'static>(store: S, config: &Config) -> Result<()> {
    let service = Arc::new(NoteService::new(store).with_max_size(config.max_note_size));
    let server = WebSocketServer::new(service);
    let listener = WebSocketServer::<S>::bind(&config.listen).await?;

    info!("Server running. Press Ctrl+C to stop.");
    server
        .run(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,paper_server=debug,paper_core=debug"
    } else {
        "info,paper_server=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_args(&args).context("Failed to load configuration")?;

    info!("Starting paper-server");
    info!("Listen address: {}", config.listen);
    info!("Max note size: {}", config.max_note_size);

    match &config.data_dir {
        Some(dir) => {
            info!("Storing notes in {:?}", dir);
            let store = FileStore::open(dir)
                .await
                .with_context(|| format!("Failed to open note directory {:?}", dir))?;
            serve(store, &config).await?;
        }
        None => {
            info!("No data directory configured, notes are kept in memory");
            serve(InMemoryStore::new(), &config).await?;
        }
    }

    info!("Shutting down");
    Ok(())
}
