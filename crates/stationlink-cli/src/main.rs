//! stationlink - station message plumbing from the command line.
//!
//! `demo` wires two stations over an in-process loopback network and runs one
//! material transfer end to end. The other subcommands operate on the record
//! store named by the config (or `--db`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stationlink_core::config::{Config, DEFAULT_LOG_LEVEL, ENV_DB_PATH, ENV_LOG_LEVEL};
use stationlink_core::domain::{MATERIAL_TRANSFER, MessageBody, MessagePriority, OutboundMessage};
use stationlink_core::impls::LoopbackNetwork;
use stationlink_core::observability::Observer;
use stationlink_core::ports::{Clock, InboundFeed, SystemClock};
use stationlink_core::protocol::{AcceptAll, MaterialTransferHandler};
use stationlink_core::store::{ExportFormat, HistoryQuery, RecordStore};
use stationlink_core::{Dispatcher, DispatcherBuilder};

#[derive(Parser)]
#[command(name = "stationlink")]
#[command(about = "Priority message dispatch and record keeping for production-line stations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file; every field is optional
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive (overrides the config)
    #[arg(short, long, global = true, env = ENV_LOG_LEVEL)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Record store path (overrides the config)
    #[arg(long, global = true, env = ENV_DB_PATH)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a material transfer between two in-process stations
    Demo {
        #[arg(long, default_value = "conveyor-1")]
        source: String,
        #[arg(long, default_value = "crane-1")]
        target: String,
        #[arg(long, default_value = "steel-coil-7")]
        material: String,
        #[arg(long, default_value_t = 3)]
        quantity: u32,
        /// Give up waiting for completion after this many seconds
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Print store statistics for the last N days
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Print recent history
    History {
        #[arg(value_enum, default_value = "messages")]
        kind: HistoryKind,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        protocol: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Write a snapshot of the store
    Backup,
    /// List snapshots in the backup directory
    Backups,
    /// Replace the store contents with a snapshot
    Restore { backup_id: String },
    /// Delete records older than N days (defaults to the configured retention)
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Export records to a JSON or CSV file
    Export {
        path: PathBuf,
        #[arg(long, default_value = "json")]
        format: ExportFormat,
        /// RFC 3339 lower bound
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum HistoryKind {
    Messages,
    Errors,
    Sessions,
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(db) = &cli.db {
        config.store.db_path = db.clone();
    }
    init_logging(&config.log_level, cli.json_logs);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::Demo {
            source,
            target,
            material,
            quantity,
            wait_secs,
        } => {
            run_demo(
                &config,
                clock,
                &source,
                &target,
                &material,
                quantity,
                Duration::from_secs(wait_secs),
            )
            .await
        }
        command => run_store_command(command, &config, clock),
    }
}

fn run_store_command(command: Commands, config: &Config, clock: Arc<dyn Clock>) -> Result<()> {
    let store = RecordStore::open(&config.store, clock, Observer::new("cli", "store"))
        .with_context(|| format!("opening store at {}", config.store.db_path.display()))?;

    match command {
        Commands::Demo { .. } => bail!("demo does not operate on an existing store"),
        Commands::Stats { days } => {
            print_json(&store.get_statistics(days)?)?;
        }
        Commands::History {
            kind,
            agent,
            protocol,
            limit,
        } => {
            let mut query = HistoryQuery::new().limit(limit);
            if let Some(agent) = agent {
                query = query.agent(agent);
            }
            if let Some(protocol) = protocol {
                query = query.protocol(protocol);
            }
            match kind {
                HistoryKind::Messages => print_json(&store.get_message_history(&query)?)?,
                HistoryKind::Errors => print_json(&store.get_error_history(&query)?)?,
                HistoryKind::Sessions => print_json(&store.get_session_history(&query)?)?,
            }
        }
        Commands::Backup => {
            let backup_id = store.create_backup()?;
            println!("{backup_id}");
        }
        Commands::Backups => {
            for backup_id in store.list_backups()? {
                println!("{backup_id}");
            }
        }
        Commands::Restore { backup_id } => {
            store
                .restore_from_backup(&backup_id)
                .with_context(|| format!("restoring backup {backup_id}"))?;
            info!(backup_id, "restore complete");
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.store.retention_days);
            print_json(&store.cleanup_old_data(days)?)?;
        }
        Commands::Export {
            path,
            format,
            start,
            end,
        } => {
            if let (Some(start), Some(end)) = (start, end)
                && start > end
            {
                bail!("--start must not be after --end");
            }
            store.export_data(&path, format, start, end)?;
            info!(path = %path.display(), %format, "export written");
        }
    }

    Ok(())
}

async fn run_demo(
    config: &Config,
    clock: Arc<dyn Clock>,
    source: &str,
    target: &str,
    material: &str,
    quantity: u32,
    wait: Duration,
) -> Result<()> {
    let store = Arc::new(
        RecordStore::open(&config.store, Arc::clone(&clock), Observer::new("demo", "store"))
            .with_context(|| format!("opening store at {}", config.store.db_path.display()))?,
    );
    let network = LoopbackNetwork::new();

    let station = |agent: &str| -> Result<(Dispatcher, Arc<dyn InboundFeed>)> {
        let feed: Arc<dyn InboundFeed> = Arc::new(network.register(agent));
        let dispatcher = DispatcherBuilder::new(agent, Arc::new(network.transport(agent)))
            .config(config)
            .clock(Arc::clone(&clock))
            .store(Arc::clone(&store))
            .default_recovery()
            .handler(
                MATERIAL_TRANSFER,
                Arc::new(MaterialTransferHandler::new(Arc::new(AcceptAll))),
            )?
            .expect_protocols(&[MATERIAL_TRANSFER])
            .build()?;
        Ok((dispatcher, feed))
    };

    let (sender, sender_feed) = station(source)?;
    let (receiver, receiver_feed) = station(target)?;
    sender.start(Some(sender_feed))?;
    receiver.start(Some(receiver_feed))?;

    sender.enqueue(
        OutboundMessage::new(
            target,
            MessageBody::MaterialTransferRequest {
                source: source.to_string(),
                material_id: material.to_string(),
                quantity,
                destination: target.to_string(),
            },
        ),
        MessagePriority::High,
    )?;

    let completed = tokio::time::timeout(wait, async {
        while receiver.statistics().sessions_completed == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();
    if !completed {
        warn!(wait_secs = wait.as_secs(), "transfer did not complete in time");
    }
    // let the final complete message reach the sender
    tokio::time::sleep(Duration::from_millis(200)).await;

    sender.stop().await;
    receiver.stop().await;

    print_json(&serde_json::json!({
        "completed": completed,
        "stations": [sender.statistics(), receiver.statistics()],
        "store": store.get_statistics(1)?,
    }))?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
