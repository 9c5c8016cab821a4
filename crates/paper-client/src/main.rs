//! paper: Command-line client for a paper-server.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use paper_client::{DocumentSession, RpcClient, SessionUpdate};
use paper_core::api::NoteApi;
use paper_core::{create_patch, ContentHash, ErrorCode, NoteEvent, ReconcileConfig};

/// Attempts at a save before giving up on concurrent writers.
const SAVE_ATTEMPTS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "paper")]
#[command(about = "1paper note client")]
struct Cli {
    /// Server URL
    #[arg(short, long, env = "PAPER_URL", default_value = "ws://127.0.0.1:3000")]
    url: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a note
    Get { id: String },

    /// Replace a note's content with a file (or stdin)
    Put {
        id: String,
        /// Read content from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Delete a note and everything under it
    Delete { id: String },

    /// Move a note and everything under it
    Move { from: String, to: String },

    /// List every note in the notebook containing a note
    Tree { id: String },

    /// List the notes under a note
    Descendants { id: String },

    /// Follow a note, printing it whenever it changes
    Watch { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so note content on stdout stays clean
    let default_filter = if cli.verbose {
        "debug,paper_client=debug,paper_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let client = Arc::new(RpcClient::connect(&cli.url).await?);
    debug!("Connected as {}", client.client_id());

    let result = run(&client, cli.command).await;
    if let Ok(mut client) = Arc::try_unwrap(client) {
        client.close().await;
    }
    result
}

async fn run(client: &Arc<RpcClient>, command: Command) -> Result<()> {
    match command {
        Command::Get { id } => {
            print!("{}", client.get(&id).await?);
        }
        Command::Put { id, file } => {
            let content = match file {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {:?}", path))?,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin().read_to_string(&mut buf).await?;
                    buf
                }
            };
            put(client, &id, &content).await?;
        }
        Command::Delete { id } => {
            for deleted in client.delete(&id).await? {
                println!("{}", deleted);
            }
        }
        Command::Move { from, to } => {
            for (old, new) in client.move_note(&from, &to).await? {
                println!("{} -> {}", old, new);
            }
        }
        Command::Tree { id } => {
            for note in client.list_tree_ids(&id).await? {
                println!("{}", note);
            }
        }
        Command::Descendants { id } => {
            for note in client.list_descendant_ids(&id).await? {
                println!("{}", note);
            }
        }
        Command::Watch { id } => watch(Arc::clone(client), id).await?,
    }
    Ok(())
}

/// Overwrite `id` with `content`, diffing against whatever is stored now.
async fn put(client: &RpcClient, id: &str, content: &str) -> Result<()> {
    let hash = ContentHash::of(content);
    for attempt in 1..=SAVE_ATTEMPTS {
        let current = client.get(id).await?;
        let patch = create_patch(&current, content);
        if patch.is_empty() {
            info!("{} is already up to date", id);
            return Ok(());
        }
        match client.save(id, &patch, hash).await {
            Ok(()) => {
                info!("Saved {} ({})", id, hash);
                return Ok(());
            }
            Err(e) if e.code() == ErrorCode::HashMismatch => {
                warn!("{} changed while saving (attempt {}), retrying", id, attempt);
            }
            Err(e) => return Err(e.into()),
        }
    }
    bail!("Gave up saving {} after {} attempts", id, SAVE_ATTEMPTS)
}

/// Print the note on every change and report notebook changes until Ctrl+C.
async fn watch(client: Arc<RpcClient>, id: String) -> Result<()> {
    client.subscribe_tree(&id).await?;
    let _tree = client.events().subscribe(|event| {
        if let NoteEvent::TreeChanged { root_id } = event {
            eprintln!("-- notebook {} changed", root_id);
        }
    });

    let mut session = DocumentSession::spawn(Arc::clone(&client), id.clone(), ReconcileConfig::default());

    loop {
        tokio::select! {
            update = session.next_update() => match update {
                Some(SessionUpdate::Content { text, .. }) => {
                    println!("{}", text);
                    println!("-- {}", id);
                }
                Some(SessionUpdate::Error { message, .. }) => warn!("{}", message),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await?;
    client.unsubscribe_tree(&id).await?;
    Ok(())
}
