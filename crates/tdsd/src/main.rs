//! tdsd: tds key server daemon
//!
//! Usage:
//!   tdsd [--config /etc/tds/config.toml] [--listen 0.0.0.0:6666]

mod daemon;
mod metrics;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tds_core::config::DaemonConfig;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tdsd", version, about = "tds popularity-aware key server")]
struct Cli {
    /// Path to tds.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "TDS_CONFIG",
        default_value = "/etc/tds/config.toml"
    )]
    config: PathBuf,

    /// Override the key server listen address
    #[arg(long, env = "TDS_LISTEN")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); defaults to daemon.log_level
    #[arg(long, env = "TDS_LOG")]
    log: Option<String>,

    /// Log format (json, text); defaults to daemon.log_format
    #[arg(long, env = "TDS_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // logging is configured from the file, so it is read before the subscriber exists
    let config_found = cli.config.exists();
    let mut config = tds_core::config::TdsConfig::load(&cli.config)?;
    let (level, format) = resolve_logging(cli.log, cli.log_format, &config.daemon)?;
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "tdsd starting"
    );
    if !config_found {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    if let Some(listen) = cli.listen {
        config.daemon.listen = listen;
    }

    daemon::run(config).await
}

/// Command-line values win; the config file supplies the rest.
fn resolve_logging(
    level: Option<String>,
    format: Option<LogFormat>,
    daemon: &DaemonConfig,
) -> Result<(String, LogFormat)> {
    let level = level.unwrap_or_else(|| daemon.log_level.clone());
    let format = match format {
        Some(format) => format,
        None => LogFormat::from_str(&daemon.log_format, true)
            .map_err(|e| anyhow!("daemon.log_format {:?}: {e}", daemon.log_format))?,
    };
    Ok((level, format))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
