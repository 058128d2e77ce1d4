//! raidstore CLI - Command line access to a RAiD registry store.
//!
//! The backend is chosen from the `STORAGE_*` environment variables, with
//! `--backend` and `--data-dir` taking precedence. Records and issuing
//! points are printed as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use raidstore_common::{IssuingPoint, NewRecord, RaidDocument, RecordFilter, RecordKey};
use raidstore_storage::{GitRepository, Repository, StorageConfig};

#[derive(Parser)]
#[command(name = "raidstore")]
#[command(about = "raidstore - RAiD identifier registry storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Storage backend: file, file-git, kv, kv-memory, or cockroach.
    #[arg(short, long, env = "STORAGE_TYPE")]
    backend: Option<String>,

    /// Data directory for the file backends.
    #[arg(short, long, env = "STORAGE_FILE_DATADIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the backend is reachable and writable.
    Health,

    /// Mint a fresh identifier without storing a record.
    Mint {
        /// Issuing point whose prefix is used as namespace.
        #[arg(short, long)]
        issuing_point: Option<i64>,
    },

    /// Register a new record from a JSON payload file.
    Create {
        /// Payload file (RAiD metadata document).
        #[arg(short, long)]
        payload: PathBuf,

        /// Issuing point to mint under.
        #[arg(short, long, conflicts_with = "handle")]
        issuing_point: Option<i64>,

        /// Register under this handle instead of minting one.
        #[arg(long)]
        handle: Option<String>,
    },

    /// Show the current version of a record, or a specific one.
    Get {
        /// Record handle or `namespace/local_id`.
        id: String,

        /// Version number.
        #[arg(long)]
        version: Option<u32>,
    },

    /// Show every version of a record, newest first.
    History {
        /// Record handle or `namespace/local_id`.
        id: String,
    },

    /// Store a new version of a record.
    Update {
        /// Record handle or `namespace/local_id`.
        id: String,

        /// Payload file for the new version.
        #[arg(short, long)]
        payload: PathBuf,
    },

    /// List current records.
    List {
        /// Only records listing this contributor id.
        #[arg(long)]
        contributor: Option<String>,

        /// Only records listing this organisation id.
        #[arg(long)]
        organisation: Option<String>,

        /// Only openly accessible records.
        #[arg(long)]
        public: bool,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Soft-delete a record. Its history stays readable.
    Delete {
        /// Record handle or `namespace/local_id`.
        id: String,
    },

    /// Show the git commits touching a record (file-git backend only).
    Changelog {
        /// Record handle or `namespace/local_id`.
        id: String,
    },

    /// Manage issuing points.
    #[command(subcommand)]
    IssuingPoint(IssuingPointCommands),
}

#[derive(Subcommand)]
enum IssuingPointCommands {
    /// Create an issuing point from a JSON file.
    Create {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show one issuing point.
    Get { id: i64 },

    /// List all issuing points.
    List,

    /// Replace an issuing point from a JSON file.
    Update {
        id: i64,

        #[arg(short, long)]
        file: PathBuf,
    },

    /// Delete an issuing point.
    Delete { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = storage_config(cli.backend.as_deref(), cli.data_dir.as_deref())?;

    if let Commands::Changelog { id } = &cli.command {
        return cmd_changelog(config, id).await;
    }

    let repo = raidstore_storage::open(&config)
        .await
        .context("Failed to open storage backend")?;
    debug!(backend = repo.name(), "Storage backend opened");

    let result = run(repo.as_ref(), cli.command).await;
    repo.close().await.context("Failed to close storage backend")?;
    result
}

/// Resolve the storage configuration, letting flags shadow the environment.
fn storage_config(backend: Option<&str>, data_dir: Option<&Path>) -> Result<StorageConfig> {
    let config = StorageConfig::from_lookup(|key| match key {
        "STORAGE_TYPE" if backend.is_some() => backend.map(str::to_string),
        "STORAGE_FILE_DATADIR" if data_dir.is_some() => {
            data_dir.map(|p| p.to_string_lossy().into_owned())
        }
        _ => std::env::var(key).ok(),
    })
    .context("Invalid storage configuration")?;
    Ok(config)
}

async fn run(repo: &dyn Repository, command: Commands) -> Result<()> {
    match command {
        Commands::Health => cmd_health(repo).await,

        Commands::Mint { issuing_point } => cmd_mint(repo, issuing_point).await,

        Commands::Create {
            payload,
            issuing_point,
            handle,
        } => cmd_create(repo, &payload, issuing_point, handle.as_deref()).await,

        Commands::Get { id, version } => cmd_get(repo, &id, version).await,

        Commands::History { id } => cmd_history(repo, &id).await,

        Commands::Update { id, payload } => cmd_update(repo, &id, &payload).await,

        Commands::List {
            contributor,
            organisation,
            public,
            limit,
            offset,
        } => {
            let filter = RecordFilter {
                contributor_id: contributor,
                organisation_id: organisation,
                limit,
                offset,
            };
            cmd_list(repo, &filter, public).await
        }

        Commands::Delete { id } => cmd_delete(repo, &id).await,

        Commands::IssuingPoint(command) => cmd_issuing_point(repo, command).await,

        Commands::Changelog { .. } => anyhow::bail!("changelog reads the git history directly"),
    }
}

/// Accept a full handle URL or a bare `namespace/local_id`.
fn parse_key(id: &str) -> Result<RecordKey> {
    if id.starts_with("https://") {
        return RecordKey::from_handle(id).context("Invalid handle");
    }
    let (namespace, local_id) = id
        .rsplit_once('/')
        .with_context(|| format!("Expected namespace/local_id, got '{}'", id))?;
    RecordKey::new(namespace, local_id).context("Invalid record id")
}

/// Read a payload file and check it parses as a RAiD document.
async fn read_payload(path: &Path) -> Result<Value> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let payload: Value = serde_json::from_slice(&bytes).context("Payload is not valid JSON")?;
    RaidDocument::from_payload(&payload).context("Payload is not a RAiD metadata document")?;
    Ok(payload)
}

async fn read_issuing_point(path: &Path) -> Result<IssuingPoint> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).context("Invalid issuing point JSON")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_health(repo: &dyn Repository) -> Result<()> {
    repo.health_check().await.context("Health check failed")?;
    println!("{}: ok", repo.name());
    Ok(())
}

async fn cmd_mint(repo: &dyn Repository, issuing_point: Option<i64>) -> Result<()> {
    let key = repo
        .generate_identifier(issuing_point)
        .await
        .context("Failed to mint identifier")?;
    println!("{}", key.handle());
    Ok(())
}

async fn cmd_create(
    repo: &dyn Repository,
    payload: &Path,
    issuing_point: Option<i64>,
    handle: Option<&str>,
) -> Result<()> {
    let payload = read_payload(payload).await?;

    let mut new = NewRecord::new(payload);
    if let Some(id) = issuing_point {
        new = new.with_issuing_point(id);
    }
    if let Some(handle) = handle {
        new = new.with_key(parse_key(handle)?);
    }

    let record = repo
        .create_record(new)
        .await
        .context("Failed to create record")?;
    info!(handle = %record.key().handle(), "Record created");
    print_json(&record)
}

async fn cmd_get(repo: &dyn Repository, id: &str, version: Option<u32>) -> Result<()> {
    let key = parse_key(id)?;
    let record = match version {
        Some(v) => repo.get_version(&key.namespace, &key.local_id, v).await,
        None => repo.get_current(&key.namespace, &key.local_id).await,
    }
    .with_context(|| format!("Failed to read {}", key))?;
    print_json(&record)
}

async fn cmd_history(repo: &dyn Repository, id: &str) -> Result<()> {
    let key = parse_key(id)?;
    let history = repo
        .get_history(&key.namespace, &key.local_id)
        .await
        .with_context(|| format!("Failed to read history of {}", key))?;
    print_json(&history)
}

async fn cmd_update(repo: &dyn Repository, id: &str, payload: &Path) -> Result<()> {
    let key = parse_key(id)?;
    let payload = read_payload(payload).await?;
    let record = repo
        .update(&key.namespace, &key.local_id, payload)
        .await
        .with_context(|| format!("Failed to update {}", key))?;
    info!(handle = %key.handle(), version = record.version, "Record updated");
    print_json(&record)
}

async fn cmd_list(repo: &dyn Repository, filter: &RecordFilter, public: bool) -> Result<()> {
    let records = if public {
        repo.list_public(filter).await
    } else {
        repo.list(filter).await
    }
    .context("Failed to list records")?;

    if records.is_empty() {
        eprintln!("No records.");
        return Ok(());
    }
    for record in records {
        println!("{}\tv{}", record.key().handle(), record.version);
    }
    Ok(())
}

async fn cmd_delete(repo: &dyn Repository, id: &str) -> Result<()> {
    let key = parse_key(id)?;
    repo.soft_delete(&key.namespace, &key.local_id)
        .await
        .with_context(|| format!("Failed to delete {}", key))?;
    println!("Deleted {}", key.handle());
    Ok(())
}

async fn cmd_changelog(config: StorageConfig, id: &str) -> Result<()> {
    let StorageConfig::FileGit(git_config) = config else {
        anyhow::bail!("changelog requires the file-git backend");
    };
    let key = parse_key(id)?;

    let repo = GitRepository::new(git_config)
        .await
        .context("Failed to open git repository")?;
    let entries = repo
        .change_log(&key.namespace, &key.local_id)
        .await
        .with_context(|| format!("Failed to read change log of {}", key))?;

    for entry in entries {
        println!(
            "{}  {}  {} <{}>  {}",
            &entry.hash[..entry.hash.len().min(10)],
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.author,
            entry.email,
            entry.message
        );
    }
    Ok(())
}

async fn cmd_issuing_point(repo: &dyn Repository, command: IssuingPointCommands) -> Result<()> {
    match command {
        IssuingPointCommands::Create { file } => {
            let point = read_issuing_point(&file).await?;
            let created = repo
                .create_issuing_point(point)
                .await
                .context("Failed to create issuing point")?;
            print_json(&created)
        }
        IssuingPointCommands::Get { id } => {
            let point = repo
                .get_issuing_point(id)
                .await
                .with_context(|| format!("Failed to read issuing point {}", id))?;
            print_json(&point)
        }
        IssuingPointCommands::List => {
            let points = repo
                .list_issuing_points()
                .await
                .context("Failed to list issuing points")?;
            print_json(&points)
        }
        IssuingPointCommands::Update { id, file } => {
            let point = read_issuing_point(&file).await?;
            let updated = repo
                .update_issuing_point(id, point)
                .await
                .with_context(|| format!("Failed to update issuing point {}", id))?;
            print_json(&updated)
        }
        IssuingPointCommands::Delete { id } => {
            repo.delete_issuing_point(id)
                .await
                .with_context(|| format!("Failed to delete issuing point {}", id))?;
            println!("Deleted issuing point {}", id);
            Ok(())
        }
    }
}
