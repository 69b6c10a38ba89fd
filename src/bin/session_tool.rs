//! Session maintenance CLI
//!
//! Inspects and repairs stored research sessions.
//!
//! # Usage
//!
//! ```bash
//! # List sessions, newest first
//! session-tool list
//!
//! # Print one session document
//! session-tool show 20260101120000_rust_async_runtimes_3f9a1c2e
//!
//! # Repair one session, or every document that fails validation
//! session-tool repair 20260101120000_rust_async_runtimes_3f9a1c2e
//! session-tool repair --all
//! ```
//!
//! The data directory defaults to `research_data` and can be set with
//! `--data-dir` or `RESEARCH_DATA_DIR`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use research_orchestrator::config::DEFAULT_DATA_DIR;
use research_orchestrator::{SalvageRepairer, SessionRepairer, SessionStore, StoreError};

/// Research session maintenance tool
#[derive(Parser, Debug)]
#[command(name = "session-tool")]
#[command(about = "Inspect and repair stored research sessions")]
#[command(version)]
struct Args {
    /// Directory holding session documents
    #[arg(long, env = "RESEARCH_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored sessions
    List,

    /// Print a session document as JSON
    Show {
        session_id: String,
    },

    /// Rebuild documents that fail schema validation
    Repair {
        /// Session to repair
        #[arg(required_unless_present = "all")]
        session_id: Option<String>,

        /// Repair every invalid document in the data directory
        #[arg(long, conflicts_with = "session_id")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let store = SessionStore::new(&args.data_dir);
    match args.command {
        Command::List => list(&store).await,
        Command::Show { session_id } => show(&store, &session_id).await,
        Command::Repair { session_id, all } => {
            let ids = if all {
                document_ids(store.dir()).await?
            } else {
                session_id.into_iter().collect()
            };
            repair(&store, &ids).await
        }
    }
}

async fn list(store: &SessionStore) -> Result<()> {
    let sessions = store.list().await?;
    if sessions.is_empty() {
        println!("No sessions in {}", store.dir().display());
        return Ok(());
    }

    for s in sessions {
        println!(
            "{}  {:<20} {:>3}/{:<3} {}",
            s.session_id,
            s.stage.as_str(),
            s.results,
            s.queries,
            s.topic
        );
    }
    Ok(())
}

async fn show(store: &SessionStore, session_id: &str) -> Result<()> {
    let session = store
        .load(session_id)
        .await
        .with_context(|| format!("loading session {}", session_id))?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

async fn repair(store: &SessionStore, ids: &[String]) -> Result<()> {
    let repairer = SalvageRepairer::new();
    let mut repaired = 0;
    let mut failed = 0;

    for session_id in ids {
        match store.load(session_id).await {
            Ok(_) => info!(session_id = %session_id, "Session is valid, nothing to repair"),
            Err(err) if err.needs_repair() => {
                let path = store.path_for(session_id)?;
                match repairer.repair(&path).await {
                    Ok(mut session) => {
                        store.save(&mut session).await?;
                        println!("Repaired {} (resumes at {})", session_id, session.stage);
                        repaired += 1;
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Repair failed");
                        failed += 1;
                    }
                }
            }
            Err(StoreError::NotFound(id)) => bail!("session {} not found", id),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Cannot repair session");
                failed += 1;
            }
        }
    }

    println!("Repaired {} of {} sessions", repaired, ids.len());
    if failed > 0 {
        bail!("{} sessions could not be repaired", failed);
    }
    Ok(())
}

/// Ids of every `*.json` document in `dir`
async fn document_ids(dir: &Path) -> Result<Vec<String>> {
    if !tokio::fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;
    Ok(())
}
