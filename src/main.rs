//! relaymq - MQTT v3.1.1 broker
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path (TOML)
//!   -b, --bind <ADDR>        Bind address (default: 0.0.0.0:1883)
//!   --max-packet-size <N>    Maximum packet size in bytes
//!   --channel-capacity <N>   Per-session subscriber channel capacity
//!   -l, --log-level <LEVEL>  Log level (error, warn, info, debug, trace)

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use relaymq::broker::{Broker, BrokerConfig};
use relaymq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
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

/// relaymq - MQTT v3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version = "0.1.0")]
#[command(about = "MQTT v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Per-session subscriber channel capacity
    #[arg(long)]
    channel_capacity: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = if let Some(config_path) = &args.config {
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

    // CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or(match file_config.log.level.to_lowercase().as_str() {
        "error" => LogLevel::Error,
        "warn" => LogLevel::Warn,
        "debug" => LogLevel::Debug,
        "trace" => LogLevel::Trace,
        _ => LogLevel::Info,
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("loaded configuration from {:?}", path);
    }

    let broker_config = BrokerConfig {
        bind_addr: args.bind.unwrap_or(file_config.server.bind),
        max_packet_size: args
            .max_packet_size
            .unwrap_or(file_config.limits.max_packet_size),
        channel_capacity: args
            .channel_capacity
            .unwrap_or(file_config.limits.channel_capacity),
    };

    info!("starting relaymq");
    info!("  bind address: {}", broker_config.bind_addr);
    info!("  max packet size: {} bytes", broker_config.max_packet_size);
    info!("  channel capacity: {}", broker_config.channel_capacity);

    let broker = Broker::new(broker_config);
    broker.run().await?;

    Ok(())
}
