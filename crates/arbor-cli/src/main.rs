//! Arbor - operator CLI for the migration lock, snapshots and history
//!
//! ## Commands
//!
//! - `check`: Probe store connectivity and lock storage access
//! - `lock`: Inspect, take, release or force-release the migration lock
//! - `backup`: Snapshot nodes to a file (or stdout)
//! - `restore`: Write a snapshot file back to the store
//! - `migrations`: List or remove executed-migration records

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use arbor_core::{
    generate_executor_id, init_tracing, BackupConfig, BackupService, LockConfig, LockService,
    LogFormat, MigrationRecordStore, NodeSelection,
};
use arbor_state::{DataStore, NodePath, StoreConfig, SurrealTreeStore, TreeStore};

#[derive(Parser)]
#[command(name = "arbor")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Migration lock, snapshot and history tooling for Arbor tree stores", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Store endpoint (overrides SURREALDB_ENDPOINT / SURREALDB_URL)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the store and the lock node are reachable
    Check,

    /// Manage the migration lock
    Lock {
        /// Lock node (default: ARBOR_LOCK_PATH or migrations_lock)
        #[arg(long)]
        path: Option<String>,

        /// Lease length in milliseconds (default: ARBOR_LOCK_TIMEOUT_MS or 300000)
        #[arg(long)]
        lease_ms: Option<u64>,

        #[command(subcommand)]
        action: LockAction,
    },

    /// Snapshot nodes as a JSON object keyed by node path
    Backup {
        /// Node to include; repeat for several (default: ARBOR_BACKUP_NODES or every node)
        #[arg(short, long = "node")]
        nodes: Vec<String>,

        /// Write the snapshot here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Overwrite every node named in a snapshot file
    Restore {
        /// Snapshot file produced by `arbor backup`
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Inspect executed-migration history
    Migrations {
        /// History collection (default: ARBOR_MIGRATIONS_PATH or migrations)
        #[arg(long)]
        path: Option<String>,

        #[command(subcommand)]
        action: MigrationsAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Show the current holder, if the lease is still valid
    Status,
    /// Take the lock (fails if it is held)
    Acquire {
        /// Executor identity (default: generated from host and pid)
        #[arg(long)]
        executor: Option<String>,
    },
    /// Release the lock if the executor holds it
    Release {
        #[arg(long)]
        executor: String,
    },
    /// Delete the lock regardless of holder
    ForceRelease,
    /// Delete the lock only if its lease has lapsed
    Cleanup,
}

#[derive(Subcommand)]
enum MigrationsAction {
    /// List executed migrations in execution order
    List,
    /// Remove the record(s) with this timestamp
    Remove { timestamp: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(format, level);

    let mut config = StoreConfig::from_env();
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    info!(endpoint = %config.endpoint, "connecting");
    let store: Arc<dyn TreeStore> = Arc::new(
        SurrealTreeStore::connect(&config)
            .await
            .context("Failed to connect to the tree store")?,
    );

    match cli.command {
        Commands::Check => cmd_check(&store).await,
        Commands::Lock {
            path,
            lease_ms,
            action,
        } => {
            let lock = LockService::new(
                Arc::clone(&store),
                lock_config(path.as_deref(), lease_ms)?,
            );
            cmd_lock(&lock, action).await
        }
        Commands::Backup { nodes, output } => {
            cmd_backup(&store, &nodes, output.as_deref()).await
        }
        Commands::Restore { input } => cmd_restore(&store, &input).await,
        Commands::Migrations { path, action } => {
            let records = record_store(&store, path.as_deref())?;
            match action {
                MigrationsAction::List => cmd_migrations_list(&records).await,
                MigrationsAction::Remove { timestamp } => {
                    cmd_migrations_remove(&records, timestamp).await
                }
            }
        }
    }
}

fn lock_config(path: Option<&str>, lease_ms: Option<u64>) -> Result<LockConfig> {
    let mut config = LockConfig::from_env().context("Invalid lock configuration")?;
    if let Some(raw) = path {
        let path = NodePath::parse(raw).context("Invalid lock path")?;
        if path.is_root() || path.is_reserved() {
            bail!("Lock path must name a writable, non-root node: {raw:?}");
        }
        config = config.with_lock_path(path);
    }
    if let Some(ms) = lease_ms {
        if ms == 0 {
            bail!("Lease must be longer than 0 ms");
        }
        config = config.with_lease_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

/// Backups never capture or overwrite the lock node.
fn lock_node() -> Result<NodePath> {
    Ok(LockConfig::from_env()
        .context("Invalid lock configuration")?
        .lock_path)
}

fn record_store<S: TreeStore + ?Sized>(
    store: &Arc<S>,
    path: Option<&str>,
) -> Result<MigrationRecordStore<S>> {
    let collection = match path {
        Some(raw) => NodePath::parse(raw).context("Invalid migrations path")?,
        None => arbor_core::migration_records::migrations_path_from_env()
            .context("Invalid migrations path")?,
    };
    Ok(MigrationRecordStore::with_collection(
        DataStore::new(Arc::clone(store)),
        collection,
    ))
}

async fn cmd_check<S: TreeStore + ?Sized>(store: &Arc<S>) -> Result<()> {
    let connected = store
        .check_connection()
        .await
        .context("Connectivity probe failed")?;
    if !connected {
        bail!("Store is unreachable");
    }
    println!("store: connected");

    let lock = LockService::new(
        Arc::clone(store),
        LockConfig::from_env().context("Invalid lock configuration")?,
    );
    let accessible = lock
        .ensure_lock_storage_accessible()
        .await
        .context("Lock storage check failed")?;
    println!(
        "lock storage ({}): {}",
        lock.lock_path(),
        if accessible { "ok" } else { "unreachable" }
    );
    Ok(())
}

async fn cmd_lock<S: TreeStore + ?Sized>(lock: &LockService<S>, action: LockAction) -> Result<()> {
    match action {
        LockAction::Status => match lock.get_lock_status().await? {
            Some(status) => {
                println!("held by {}", status.executor_id);
                println!("  locked at:  {}", status.locked_at.format("%Y-%m-%d %H:%M:%S UTC"));
                println!("  expires at: {}", status.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
                if let Some(host) = &status.hostname {
                    println!("  host:       {host}");
                }
                if let Some(pid) = status.process_id {
                    println!("  pid:        {pid}");
                }
            }
            None => println!("unlocked"),
        },
        LockAction::Acquire { executor } => {
            let executor = executor.unwrap_or_else(generate_executor_id);
            if !lock.acquire_lock(&executor).await? {
                bail!("Lock at {} is held by another executor", lock.lock_path());
            }
            println!("acquired as {executor}");
        }
        LockAction::Release { executor } => {
            lock.release_lock(&executor).await?;
            println!("released (if held by {executor})");
        }
        LockAction::ForceRelease => {
            lock.force_release_lock().await?;
            println!("lock deleted");
        }
        LockAction::Cleanup => {
            lock.check_and_release_expired_lock().await?;
            println!("expired lease cleared (if any)");
        }
    }
    Ok(())
}

async fn cmd_backup<S: TreeStore + ?Sized>(
    store: &Arc<S>,
    nodes: &[String],
    output: Option<&Path>,
) -> Result<()> {
    let config = if nodes.is_empty() {
        BackupConfig::from_env().context("Invalid backup configuration")?
    } else {
        let paths = nodes
            .iter()
            .map(|raw| NodePath::parse(raw).with_context(|| format!("Invalid node path: {raw}")))
            .collect::<Result<Vec<_>>>()?;
        BackupConfig {
            nodes: NodeSelection::Only(paths),
            ..BackupConfig::default()
        }
    };

    let service = BackupService::new(Arc::clone(store), config.excluding(lock_node()?));
    let snapshot = service.backup().await.context("Backup failed")?;

    match output {
        Some(path) => {
            std::fs::write(path, &snapshot)
                .with_context(|| format!("Failed to write snapshot to {path:?}"))?;
            println!("Snapshot written to {path:?}");
        }
        None => println!("{snapshot}"),
    }
    Ok(())
}

async fn cmd_restore<S: TreeStore + ?Sized>(store: &Arc<S>, input: &Path) -> Result<()> {
    let snapshot = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read snapshot from {input:?}"))?;

    let service = BackupService::new(
        Arc::clone(store),
        BackupConfig::default().excluding(lock_node()?),
    );
    service
        .restore(Some(&snapshot))
        .await
        .context("Restore failed")?;
    println!("Restored from {input:?}");
    Ok(())
}

async fn cmd_migrations_list<S: TreeStore + ?Sized>(records: &MigrationRecordStore<S>) -> Result<()> {
    let all = records.get_all_executed().await?;
    if all.is_empty() {
        println!("No migrations recorded under {}", records.collection());
        return Ok(());
    }
    for record in all {
        println!(
            "{:>16}  {:<10}  {}  [{}]",
            record.timestamp,
            record.status,
            record.name,
            record.key().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_migrations_remove<S: TreeStore + ?Sized>(
    records: &MigrationRecordStore<S>,
    timestamp: i64,
) -> Result<()> {
    if !records.remove(timestamp).await? {
        bail!("No migration recorded with timestamp {timestamp}");
    }
    println!("Removed migration {timestamp}");
    Ok(())
}
