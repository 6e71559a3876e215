//! swh-deposit command line
//!
//! ## Usage
//!
//! ```bash
//! # Archive a published record described by a manifest
//! swh-deposit archive record.json
//!
//! # Inspect deposits
//! swh-deposit show --owner rec-123
//! swh-deposit list --status WAITING
//! swh-deposit stats
//!
//! # Operator actions
//! swh-deposit sync <deposit-id>
//! swh-deposit set-status <deposit-id> FAILED
//! swh-deposit cleanup
//!
//! # Resume polling and run the cleanup loop until Ctrl-C
//! swh-deposit worker
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swh_deposit::services::{spawn_logging_listener, LoggingIndexer};
use swh_deposit::{
    Config, DepositDb, DepositStatus, PublishedRecord, Services, StatusUpdate, SwordClient,
    TaskRunner,
};

#[derive(Parser, Debug)]
#[command(name = "swh-deposit")]
#[command(about = "Archive published records in Software Heritage")]
struct Args {
    /// Path to config file (defaults to <data-dir>/config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding deposits.db
    #[arg(long, env = "SWH_DEPOSIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// SWORD collection IRI
    #[arg(long, env = "SWH_DEPOSIT_COLLECTION_IRI")]
    collection_iri: Option<String>,

    /// Deposit client username
    #[arg(long, env = "SWH_DEPOSIT_USERNAME")]
    username: Option<String>,

    /// Deposit client password
    #[arg(long, env = "SWH_DEPOSIT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive the record described by a JSON manifest and wait for the outcome
    Archive { manifest: PathBuf },

    /// Print one deposit
    Show {
        #[arg(long, conflicts_with = "owner", required_unless_present = "owner")]
        id: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Print deposits in a status
    List {
        #[arg(long, default_value = "WAITING")]
        status: DepositStatus,
    },

    /// Deposit counts per status
    Stats,

    /// Fetch the archive status of a deposit and apply it
    Sync { id: String },

    /// Set a status by hand (local name, code or archive status)
    SetStatus { id: String, status: StatusUpdate },

    /// Sweep stale WAITING deposits once
    Cleanup,

    /// Poll WAITING deposits and run periodic cleanup until Ctrl-C
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("swh_deposit=info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    config.validate()?;

    let db = Arc::new(
        DepositDb::open(&config.storage.data_dir)
            .with_context(|| format!("opening {}", config.storage.data_dir.display()))?,
    );

    match args.command {
        Command::Show { id, owner } => {
            let deposit = match (id, owner) {
                (Some(id), _) => Some(db.get(&id)?),
                (None, Some(owner)) => db.get_by_owner(&owner)?,
                (None, None) => bail!("--id or --owner is required"),
            };
            match deposit {
                Some(deposit) => print_json(&deposit)?,
                None => println!("no deposit"),
            }
        }
        Command::List { status } => print_json(&db.list_by_status(status)?)?,
        Command::Stats => print_json(&db.stats()?)?,
        command => run_with_archive(command, db, &config).await?,
    }

    Ok(())
}

/// Commands that talk to the archive
async fn run_with_archive(command: Command, db: Arc<DepositDb>, config: &Config) -> anyhow::Result<()> {
    if config.archive.collection_iri.is_empty() {
        bail!("archive.collection_iri is not configured");
    }
    let client = Arc::new(SwordClient::new(&config.archive)?);
    let services = Services::new(db, client, config);
    let listener = spawn_logging_listener(services.events.clone());
    let service = services.deposits.clone();

    match command {
        Command::Archive { manifest } => {
            let record = PublishedRecord::from_manifest(&manifest)
                .with_context(|| format!("loading manifest {}", manifest.display()))?;
            let runner = TaskRunner::new(service, Arc::new(LoggingIndexer), config);
            let deposit = runner.process_published_record(&record).await?;
            print_json(&deposit)?;
        }
        Command::Sync { id } => match service.sync_status(&id).await? {
            Some(deposit) => print_json(&deposit)?,
            None => println!("no deposit {}", id),
        },
        Command::SetStatus { id, status } => {
            let mut deposit = service.read(&id)?;
            if !service.update_status(&mut deposit, status)? {
                info!(deposit_id = %id, status = %deposit.status, "Status unchanged");
            }
            print_json(&deposit)?;
        }
        Command::Cleanup => print_json(&service.cleanup().await?)?,
        Command::Worker => {
            let runner = Arc::new(TaskRunner::new(service, Arc::new(LoggingIndexer), config));
            let pollers = runner.resume_waiting()?;
            let cleanup = runner.spawn_cleanup_loop();
            info!(pollers = pollers.len(), "Worker running, Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            cleanup.abort();
            for poller in pollers {
                poller.abort();
            }
        }
        other => bail!("{:?} does not use the archive", other),
    }

    listener.abort();
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let default_path = args
        .data_dir
        .clone()
        .unwrap_or_else(swh_deposit::config::default_data_dir)
        .join("config.toml");

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None if default_path.exists() => Config::load(&default_path)?,
        None => Config::default(),
    };

    // CLI and environment override the file
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(iri) = &args.collection_iri {
        config.archive.collection_iri = iri.clone();
    }
    if let Some(username) = &args.username {
        config.archive.username = username.clone();
    }
    if args.password.is_some() {
        config.archive.password = args.password.clone();
    }
    if config.archive.password.is_none() && !config.archive.username.is_empty() {
        warn!("No archive password configured, requests will be unauthenticated");
    }

    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
