/// Maintenance tool for a Recall memory database
///
/// Usage:
///   recallctl [--db-path <path>] <command>
///
/// Commands:
///   stats           Print record, graph and component statistics
///   export          Write every record (and edges, for JSON) to a file or stdout
///   import          Merge an export into the database
///   rebuild-index   Re-embed records and rebuild the vector index
///   relink          Run the auto-link policy over every record
///   repair          Re-derive indexes and graph from the database

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recall_schemas::ExportFormat;
use recall_store::{Collaborators, MemoryConfig, MemoryStore};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "recallctl")]
#[command(about = "Inspect and maintain a Recall memory database")]
struct Args {
    /// Path to SQLite database file (defaults to RECALL_DB_PATH or ~/.local/share/recall/memory.db)
    #[arg(long, short, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print record, graph and component statistics as JSON
    Stats,

    /// Export the database
    Export {
        /// json (lossless) or csv (content, importance, type, tags, timestamps)
        #[arg(long, default_value = "json")]
        format: ExportFormat,

        /// Output file; stdout when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Import records from an export file
    Import {
        file: PathBuf,

        #[arg(long, default_value = "json")]
        format: ExportFormat,
    },

    /// Rebuild the vector index, embedding records without a cached vector
    RebuildIndex {
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Create missing similarity links between existing records
    Relink,

    /// Drop dangling edges and rebuild in-memory indexes
    Repair,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = MemoryConfig::from_env().context("invalid configuration")?;
    if let Some(path) = args.db_path {
        config.db_path = path;
    }
    info!("Database: {}", config.db_path.display());

    let mut store = MemoryStore::open(config, Collaborators::from_env()).context("failed to open memory store")?;

    match args.command {
        Command::Stats => {
            let stats = store.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Export { format, output } => {
            let bytes = store.export(format)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    info!("Exported {} memories to {}", store.len(), path.display());
                }
                None => std::io::stdout().write_all(&bytes)?,
            }
        }
        Command::Import { file, format } => {
            let bytes = std::fs::read(&file).with_context(|| format!("cannot read {}", file.display()))?;
            let report = store.import(&bytes, format)?;

            info!("Imported:        {}", report.imported.len());
            info!("Already present: {}", report.skipped_existing.len());
            info!("Edges:           {}", report.edges_imported);
            for err in &report.errors {
                warn!(
                    "  entry {} ({}): {}",
                    err.index,
                    err.id.as_deref().unwrap_or("no id"),
                    err.message
                );
            }
        }
        Command::RebuildIndex { timeout_secs } => {
            let indexed = store
                .rebuild_vector_index(timeout_secs.map(Duration::from_secs))
                .await?;
            info!("Vector index holds {} entries", indexed);
        }
        Command::Relink => {
            let linked = store.relink_all()?;
            info!("Created or updated {} links", linked);
        }
        Command::Repair => {
            let report = store.repair()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
