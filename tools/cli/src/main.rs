//! Mailsync CLI - Command line interface for account sync.
//!
//! This tool runs a sync worker against a remote collection API and
//! inspects or resets the progress it persists locally.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mailsync_api::{ApiConfig, HttpApi};
use mailsync_common::{Account, AccountId, Collection, OrganizationUnit};
use mailsync_storage::{state_key, KeyValueStore, LocalStore};
use mailsync_sync::{Collaborators, SyncConfig, SyncState, SyncWorker};

#[derive(Parser)]
#[command(name = "mailsync")]
#[command(about = "Mailsync - Incremental mail account sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding sync state and fetched items.
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Unit {
    Label,
    Folder,
}

impl From<Unit> for OrganizationUnit {
    fn from(unit: Unit) -> Self {
        match unit {
            Unit::Label => OrganizationUnit::Label,
            Unit::Folder => OrganizationUnit::Folder,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync an account until interrupted.
    Run {
        /// Account identifier.
        #[arg(short, long)]
        account: String,

        /// API root URL.
        #[arg(short, long)]
        base_url: String,

        /// Bearer token; read from MAILSYNC_TOKEN when omitted.
        #[arg(short, long, env = "MAILSYNC_TOKEN", hide_env_values = true)]
        token: String,

        /// How the account organizes mail.
        #[arg(short, long, value_enum, default_value = "label")]
        unit: Unit,

        /// JSON file overriding sync settings.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Skip the metadata prefetch.
        #[arg(long)]
        no_metadata: bool,
    },

    /// Show persisted sync progress.
    Status {
        /// Account identifier.
        #[arg(short, long)]
        account: String,
    },

    /// Forget persisted sync progress.
    Reset {
        /// Account identifier.
        #[arg(short, long)]
        account: String,

        /// Only reset this collection.
        #[arg(short, long)]
        collection: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = resolve_data_dir(cli.data_dir)?;

    match cli.command {
        Commands::Run {
            account,
            base_url,
            token,
            unit,
            config,
            no_metadata,
        } => {
            let mut api = ApiConfig::new(base_url, token);
            api.metadata_supported = !no_metadata;
            cmd_run(&data_dir, &account, unit.into(), api, config.as_deref()).await
        }

        Commands::Status { account } => cmd_status(&data_dir, &account).await,

        Commands::Reset {
            account,
            collection,
        } => cmd_reset(&data_dir, &account, collection.as_deref()).await,
    }
}

/// Use the given directory or fall back to the platform data directory.
fn resolve_data_dir(data_dir: Option<PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(dir) => Ok(dir),
        None => dirs::data_local_dir()
            .map(|dir| dir.join("mailsync"))
            .context("No local data directory; pass --data-dir"),
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    SyncConfig::from_json(&json).context("Invalid sync config")
}

/// Run a sync worker until Ctrl-C.
async fn cmd_run(
    data_dir: &Path,
    account: &str,
    unit: OrganizationUnit,
    api: ApiConfig,
    config: Option<&Path>,
) -> Result<()> {
    let config = load_config(config)?;
    let account = Account::new(AccountId::new(account).context("Invalid account id")?, unit);

    let store = Arc::new(LocalStore::new(data_dir).context("Failed to open data directory")?);
    let api = HttpApi::new(api).context("Failed to create API client")?;
    let collaborators = Collaborators::new(Arc::new(api), store.clone(), store);

    info!("Syncing {} into {}", account.id, data_dir.display());
    let worker = SyncWorker::new(account, collaborators, config);
    worker.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted; saving progress");

    if let Err(e) = worker.flush().await {
        warn!("Failed to save sync state: {}", e);
    }
    worker.cleanup().await;

    if let Some(stats) = worker.stats().await {
        println!(
            "Synced {} items; {}/{} collections complete, {} failed.",
            stats.fetched, stats.complete, stats.collections, stats.failed
        );
    }
    Ok(())
}

async fn load_state(store: &LocalStore, account: &AccountId) -> Result<Option<SyncState>> {
    let value = store
        .load(&state_key(account))
        .await
        .context("Failed to read sync state")?;
    value
        .map(SyncState::from_value)
        .transpose()
        .context("Failed to decode sync state")
}

/// Print persisted sync progress.
async fn cmd_status(data_dir: &Path, account: &str) -> Result<()> {
    let account = AccountId::new(account).context("Invalid account id")?;
    let store = LocalStore::new(data_dir).context("Failed to open data directory")?;

    let Some(state) = load_state(&store, &account).await? else {
        println!("No sync state for {}.", account);
        return Ok(());
    };

    println!("Sync state for {}:", account);
    println!(
        "  {:<10} {:<9} {:>8} {:>8}  {}",
        "COLLECTION", "STATUS", "FETCHED", "COUNT", "ERROR"
    );
    for (name, collection) in state.collections() {
        let status = if collection.complete() {
            "complete"
        } else if collection.busy() {
            "busy"
        } else if collection.error().is_some() {
            "failed"
        } else {
            "idle"
        };
        let count = collection
            .count()
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        let error = match (collection.error(), collection.error_request_range()) {
            (Some(error), Some(range)) => format!("{} ({})", error, range),
            _ => String::new(),
        };
        println!(
            "  {:<10} {:<9} {:>8} {:>8}  {}",
            name,
            status,
            collection.fetched(),
            count,
            error
        );
    }

    if let Some(cursor) = state.cursor() {
        println!("  Cursor: {}", cursor);
    }
    let stats = state.stats();
    println!(
        "  {}/{} complete, {} items fetched",
        stats.complete, stats.collections, stats.fetched
    );
    Ok(())
}

/// Delete persisted progress for an account or one of its collections.
async fn cmd_reset(data_dir: &Path, account: &str, collection: Option<&str>) -> Result<()> {
    let account = AccountId::new(account).context("Invalid account id")?;
    let store = LocalStore::new(data_dir).context("Failed to open data directory")?;
    let key = state_key(&account);

    let Some(name) = collection else {
        store
            .delete(&key)
            .await
            .context("Failed to delete sync state")?;
        println!("Sync state for {} reset.", account);
        return Ok(());
    };

    let collection = Collection::parse(name).context("Unknown collection")?;
    let Some(mut state) = load_state(&store, &account).await? else {
        println!("No sync state for {}.", account);
        return Ok(());
    };
    if state.remove(collection).is_none() {
        println!("{} has no progress to reset.", collection);
        return Ok(());
    }

    store
        .persist(&key, state.to_value()?)
        .await
        .context("Failed to write sync state")?;
    println!("Progress for {} reset.", collection);
    Ok(())
}
