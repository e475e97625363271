//! CareCircle sync CLI
//!
//! Inspects and drives the local sync database of a CareCircle client.

mod commands;
mod display;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use carecircle_sync::{ActionType, Connectivity, EntityKind, SyncConfig};
use logger_redacted::{init_tracing, LoggerConfig};

#[derive(Parser)]
#[command(name = "carecircle")]
#[command(version, about = "Offline sync operator tool for CareCircle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, global = true, env = "CARECIRCLE_CONFIG")]
    config: Option<PathBuf>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Treat the network as unavailable
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync state
    Status,

    /// List pending actions in replay order
    Queue,

    /// Submit a write, queueing it when offline
    Enqueue {
        /// Action type (e.g. medication-log, shift-check-in)
        #[arg(long = "type", value_name = "TYPE")]
        action_type: ActionType,

        /// JSON request body
        #[arg(long)]
        payload: String,
    },

    /// Replay pending actions now
    Sync,

    /// Read cached entity snapshots
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Follow the realtime feed of a circle and apply it to the cache
    Listen {
        /// Circle id
        #[arg(long)]
        scope: String,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Erase the queue, cache and sync metadata
    Logout {
        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show one cached entry
    Get {
        /// Entity kind (e.g. emergency-info, timeline)
        #[arg(long)]
        kind: EntityKind,

        /// Circle or care recipient id
        #[arg(long)]
        scope: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let logger = LoggerConfig {
        log_level: "warn".to_string(),
        ..Default::default()
    }
    .verbose(cli.verbose);
    init_tracing(&logger).context("Failed to initialize logging")?;

    let config = SyncConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let connectivity = if cli.offline {
        Connectivity::Offline
    } else {
        Connectivity::Online
    };
    tracing::debug!(
        database = %config.database_path,
        api = %config.api_base_url,
        ?connectivity,
        "Configuration loaded"
    );

    let ctx = commands::Context {
        config,
        connectivity,
        json: cli.json,
    };

    match cli.command {
        Commands::Status => commands::status(&ctx).await?,
        Commands::Queue => commands::queue(&ctx).await?,
        Commands::Enqueue {
            action_type,
            payload,
        } => commands::enqueue(&ctx, action_type, &payload).await?,
        Commands::Sync => commands::sync(&ctx).await?,
        Commands::Cache(CacheCommands::Get { kind, scope }) => {
            commands::cache_get(&ctx, kind, &scope).await?;
        }
        Commands::Listen { scope, seconds } => commands::listen(&ctx, &scope, seconds).await?,
        Commands::Logout { yes } => commands::logout(&ctx, yes).await?,
        Commands::Config => commands::show_config(&ctx)?,
    }

    Ok(())
}
