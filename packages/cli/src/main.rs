//! queue-monitor - watch and edit a queue server's plan queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actors::{MonitorConfig, MonitorHandle, QueueCommand, start_monitor};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use queue_client::{HttpQueueServer, MemoryQueueServer, QueueServer};
use queue_core::MonitorEvent;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod render;

use render::render_table;

/// How long to wait for the first snapshot.
const FIRST_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);

/// queue-monitor - watch and edit a queue server's plan queue
#[derive(Parser, Debug)]
#[command(name = "queue-monitor")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Queue server URL (overrides the configuration)
    #[arg(long)]
    server_url: Option<String>,

    /// API key for the queue server
    #[arg(long)]
    api_key: Option<String>,

    /// Use an in-process demo server instead of a real one
    #[arg(long)]
    demo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the queue table once
    Show,

    /// Follow the queue, printing events and table changes
    Watch,

    /// Edit one cell of a queued row
    Edit {
        /// Row number as shown by `show`
        row: usize,
        /// Column id
        column: String,
        /// New value; empty clears the parameter
        value: String,
    },

    /// Move a queued row onto another row
    Move {
        row: usize,
        target: usize,
    },

    /// Remove queued rows
    Remove {
        #[arg(required = true)]
        rows: Vec<usize>,
    },

    /// Copy queued or completed rows to the front of the queue
    Duplicate {
        #[arg(required = true)]
        rows: Vec<usize>,
    },

    /// Start the queue
    Start,

    /// Stop the queue after the current item
    Stop,

    /// Remove every queued item
    ClearQueue,

    /// Remove every completed item
    ClearHistory,
}

fn load_config(cli: &Cli) -> Result<MonitorConfig> {
    let mut config = match &cli.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => MonitorConfig::default().with_env()?,
    };
    if let Some(url) = &cli.server_url {
        config = config.with_server_url(url.clone());
    }
    if let Some(key) = &cli.api_key {
        config = config.with_api_key(key.clone());
    }
    Ok(config)
}

fn connect(cli: &Cli, config: &MonitorConfig) -> Result<Arc<dyn QueueServer>> {
    if cli.demo {
        return Ok(Arc::new(MemoryQueueServer::demo()));
    }
    let server = HttpQueueServer::new(&config.server_url, config.remote_timeout())?
        .with_api_key(config.api_key.clone());
    Ok(Arc::new(server))
}

/// Ask for a poll and wait until it lands.
async fn first_snapshot(
    monitor: &MonitorHandle,
    events: &mut broadcast::Receiver<MonitorEvent>,
) -> Result<()> {
    monitor.refresh()?;
    let wait = async {
        loop {
            match events.recv().await {
                Ok(MonitorEvent::SnapshotApplied { .. }) => return Ok(()),
                Ok(MonitorEvent::Disconnected { error, .. }) => {
                    bail!("Cannot reach the queue server: {}", error)
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(anyhow::Error::from(e)),
            }
        }
    };
    tokio::time::timeout(FIRST_SNAPSHOT_TIMEOUT, wait)
        .await
        .context("Timed out waiting for the queue")?
}

async fn watch(monitor: &MonitorHandle, events: &mut broadcast::Receiver<MonitorEvent>) -> Result<()> {
    let mut shown = render_table(&monitor.table().await?);
    println!("{}", shown);
    let mut last_status = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                };
                let quiet = match &event {
                    MonitorEvent::SnapshotApplied { .. } => true,
                    MonitorEvent::ServerStatus { status, .. } => {
                        let unchanged = last_status.as_ref() == Some(status);
                        last_status = Some(status.clone());
                        unchanged
                    }
                    _ => false,
                };
                if !quiet {
                    println!("[{}] {}", event.timestamp().format("%H:%M:%S"), event.description());
                }
                if event.changes_table() {
                    let table = render_table(&monitor.table().await?);
                    if table != shown {
                        println!("{}", table);
                        shown = table;
                    }
                }
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let server = connect(&cli, &config)?;
    tracing::info!("Using queue server {}", server.endpoint());

    let (monitor, join) = start_monitor(config, server).await?;
    let mut events = monitor.subscribe();
    first_snapshot(&monitor, &mut events).await?;

    let outcome = match cli.command {
        Commands::Show => {
            print!("{}", render_table(&monitor.table().await?));
            Ok(())
        }
        Commands::Watch => watch(&monitor, &mut events).await,
        Commands::Edit { row, column, value } => monitor
            .edit(row, column, value)
            .await
            .map(|message| println!("{}", message))
            .map_err(Into::into),
        Commands::Move { row, target } => monitor
            .move_row(row, target)
            .await
            .map(|destination| println!("Moved to position {}", destination))
            .map_err(Into::into),
        Commands::Remove { rows } => command(&monitor, QueueCommand::RemoveRows(rows)).await,
        Commands::Duplicate { rows } => {
            command(&monitor, QueueCommand::DuplicateRows(rows)).await
        }
        Commands::Start => command(&monitor, QueueCommand::StartQueue).await,
        Commands::Stop => command(&monitor, QueueCommand::StopQueue).await,
        Commands::ClearQueue => command(&monitor, QueueCommand::ClearQueue).await,
        Commands::ClearHistory => command(&monitor, QueueCommand::ClearHistory).await,
    };

    monitor.shutdown()?;
    let _ = join.await;
    outcome
}

async fn command(monitor: &MonitorHandle, command: QueueCommand) -> Result<()> {
    let message = monitor.command(command).await?;
    println!("{}", message);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(cli).await
}
