//! RelayMQ - Message queue delivery engine
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   --acknowledge <MODE>   Acknowledge mode (none, request, wait)
//!   --message-limit <N>    Maximum stored messages per queue (0 = unlimited)
//!   --client-limit <N>     Maximum subscribers per queue (0 = unlimited)
//!   --store <KIND>         Store layout (linked, keyed)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use relaymq::broker::Broker;
use relaymq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// RelayMQ - Message queue delivery engine
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version = "0.1.0")]
#[command(about = "Message queue delivery engine")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Acknowledge mode for new queues (none, request, wait)
    #[arg(long)]
    acknowledge: Option<String>,

    /// Maximum stored messages per queue (0 = unlimited)
    #[arg(long)]
    message_limit: Option<usize>,

    /// Maximum subscribers per queue (0 = unlimited)
    #[arg(long)]
    client_limit: Option<usize>,

    /// Store layout for new queues (linked, keyed)
    #[arg(long)]
    store: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // CLI args override file config
    if let Some(acknowledge) = args.acknowledge {
        config.queue.acknowledge = acknowledge;
    }
    if let Some(message_limit) = args.message_limit {
        config.queue.message_limit = message_limit;
    }
    if let Some(client_limit) = args.client_limit {
        config.queue.client_limit = client_limit;
    }
    if let Some(store) = args.store {
        config.queue.store = store;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(config_path) = &args.config {
        info!("Loaded configuration from {:?}", config_path);
    }

    info!("Starting RelayMQ");
    info!("  Acknowledge mode: {}", config.queue.acknowledge);
    info!("  Message limit: {}", config.queue.message_limit);
    info!("  Client limit: {}", config.queue.client_limit);
    info!("  Store layout: {}", config.queue.store);
    if config.cluster.enabled {
        info!(
            "  Cluster: enabled (node={}, peers={})",
            config.cluster.node_id,
            config.cluster.peers.join(", ")
        );
    } else {
        info!("  Cluster: disabled");
    }

    let broker = Broker::new(&config);

    // Queues are created on demand; the process runs until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    broker.shutdown();

    Ok(())
}
