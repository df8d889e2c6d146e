//! Binary entrypoint for the Meshbridge CLI.
//!
//! Commands:
//! - `start [--source <path|->]` - run the bridge, reading JSON-lines radio events
//! - `init` - create a starter `config.toml` and an empty database
//! - `status` - print store statistics
//! - `query <active|nodes|node|recent|search|talkers|stats>` - run a chat query locally
//! - `maintain` - run one maintenance pass now
//!
//! Relayed messages and notices are written to stdout as JSON lines; logs go
//! to stderr and the configured log file.
//!
//! See the library crate docs for module‑level details: `meshbridge::`.
use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;

use meshbridge::bridge::{Bridge, CommandCooldown, CommandError, Query, QueryService};
use meshbridge::config::Config;
use meshbridge::meshtastic::reader;
use meshbridge::metrics::Metrics;
use meshbridge::storage::{maintenance, schema, StorageError, Store, StoreOptions};

#[derive(Parser)]
#[command(name = "meshbridge")]
#[command(about = "Bridge between a Meshtastic mesh and a chat platform")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge
    Start {
        /// Radio event source: "-" for stdin or a JSON-lines file (overrides radio.source)
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Write a default configuration and initialize the database
    Init,
    /// Show database statistics
    Status,
    /// Run a query against the database
    Query {
        #[command(subcommand)]
        query: QueryCommand,
    },
    /// Run one maintenance pass (prune, optimize) now
    Maintain,
}

#[derive(Subcommand)]
enum QueryCommand {
    /// Nodes heard recently
    Active {
        /// Minutes (defaults to bridge.active_node_threshold_minutes)
        #[arg(short, long)]
        minutes: Option<u64>,
    },
    /// Every known node
    Nodes,
    /// One node by name or id, with its last position and telemetry
    Node { name: String },
    /// Most recent messages
    Recent {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Messages containing a text
    Search {
        text: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Most active senders
    Talkers {
        #[arg(long, default_value_t = 24)]
        hours: u32,
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
    /// Network statistics
    Stats {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
}

impl From<QueryCommand> for Query {
    fn from(cmd: QueryCommand) -> Self {
        match cmd {
            QueryCommand::Active { minutes } => Query::ActiveNodes { minutes },
            QueryCommand::Nodes => Query::AllNodes,
            QueryCommand::Node { name } => Query::Node { name },
            QueryCommand::Recent { limit } => Query::RecentMessages { limit },
            QueryCommand::Search { text, limit } => Query::SearchMessages { text, limit },
            QueryCommand::Talkers { hours, limit } => Query::TopTalkers { hours, limit },
            QueryCommand::Stats { hours } => Query::Stats { hours },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init writes the config, everything else needs it
    let config = if matches!(cli.command, Commands::Init) {
        None
    } else {
        Some(Config::load(&cli.config).await?)
    };
    init_logging(config.as_ref(), cli.verbose);

    match (cli.command, config) {
        (Commands::Init, _) => {
            if Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists, not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            let cfg = Config::default();
            let store = open_store(&cfg)?;
            info!(
                "Initialized database {} (schema v{})",
                cfg.storage.db_path,
                schema::SCHEMA_VERSION
            );
            store.close()?;
        }
        (Commands::Start { source }, Some(config)) => {
            info!("Starting Meshbridge v{}", env!("CARGO_PKG_VERSION"));
            let source = source.unwrap_or_else(|| config.radio.source.clone());
            let mut bridge = Bridge::new(config).await?;

            if let Some(mut chat) = bridge.take_chat_events() {
                tokio::spawn(async move {
                    while let Some(event) = chat.recv().await {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!("Unserializable chat event: {}", e),
                        }
                    }
                });
            }

            let input = reader::open_source(&source)
                .map_err(|e| anyhow!("Failed to open radio source {}: {}", source, e))?;
            let label = if source == "-" { "stdin" } else { source.as_str() };
            info!("Reading radio events from {}", label);
            let radio = reader::spawn(input, bridge.ingest_handle())?;

            bridge.run().await?;
            // a reader blocked on stdin is left behind; the process is exiting
            if radio.is_finished() {
                if let Ok(stats) = radio.join() {
                    info!(
                        "Radio reader: {} events submitted, {} evicted",
                        stats.submitted, stats.dropped
                    );
                }
            }
        }
        (Commands::Status, Some(config)) => {
            let store = match open_store(&config) {
                Ok(store) => store,
                Err(e) => {
                    error!("{}", e);
                    return Ok(());
                }
            };
            let day_ago = Utc::now() - ChronoDuration::hours(24);
            let active = store.active_nodes(config.bridge.active_node_threshold_minutes)?;
            let status = serde_json::json!({
                "database": config.storage.db_path,
                "schema_version": schema::SCHEMA_VERSION,
                "size_bytes": store.database_size_bytes()?,
                "nodes": store.node_count()?,
                "active_nodes": active.len(),
                "new_nodes_24h": store.new_nodes_since(day_ago)?.len(),
                "messages_24h": store.count_messages_since(day_ago)?,
                "link_quality_24h": store.avg_link_quality_since(day_ago)?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            store.close()?;
        }
        (Commands::Query { query }, Some(config)) => {
            let store = open_store(&config)?;
            let service = QueryService::new(
                store.clone(),
                Arc::new(CommandCooldown::new(config.bridge.command_cooldown())),
                &config.bridge,
                Arc::new(Metrics::new()),
            );
            match service.query(query.into()).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(CommandError::NotFound(what)) => println!("No match for {}", what),
                Err(e) => {
                    store.close()?;
                    return Err(e.into());
                }
            }
            store.close()?;
        }
        (Commands::Maintain, Some(config)) => {
            let store = open_store(&config)?;
            let report = maintenance::run_once(&store, &config.maintenance)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            store.close()?;
        }
        (_, None) => return Err(anyhow!("No configuration loaded from {}", cli.config)),
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<Store> {
    match Store::open(&config.storage.db_path, StoreOptions::from(&config.storage)) {
        Ok(store) => Ok(store),
        Err(StorageError::AlreadyLocked(path)) => Err(anyhow!(
            "Database {} is locked by a running bridge; stop it first",
            path
        )),
        Err(e) => Err(e.into()),
    }
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| std::fs::OpenOptions::new().create(true).append(true).open(path).ok());
    let security_path = config.and_then(|c| c.logging.security_file.clone());

    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

        // Foreground runs echo to the console too
        let is_tty = atty::is(atty::Stream::Stdout);

        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());

            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }

            if record.target() == "security" {
                if let Some(ref sec_path) = security_path {
                    if let Ok(mut sf) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(sec_path)
                    {
                        let _ = writeln!(sf, "{}", line);
                    }
                }
            }

            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
