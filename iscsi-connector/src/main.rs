//! iSCSI Volume Connector
//!
//! Command-line front end that attaches a volume and prints its device
//! path, or detaches a volume by WWN.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use iscsi_connector::{ConnectorConfig, ConnectorRegistry, Properties, SystemRunner, metrics};

/// CLI arguments for the connector
#[derive(Parser, Debug)]
#[command(name = "iscsi-connector")]
#[command(about = "Attach and detach iSCSI volumes on this host")]
struct Args {
    /// Transport driver (iscsi, local)
    #[arg(long, default_value = "iscsi")]
    protocol: String,

    /// Root under which sys/ and dev/ are resolved
    #[arg(long, env = "CONNECTOR_SYSFS_ROOT", default_value = "/")]
    sysfs_root: PathBuf,

    /// Deadline for a single external command, in seconds
    #[arg(long, default_value = "30")]
    command_timeout: u64,

    /// TCP probe timeout per portal in seconds (0 disables the probe)
    #[arg(long, default_value = "3")]
    portal_probe_timeout: u64,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a volume and print its device path
    Connect {
        /// Connection properties as JSON, or @FILE to read them from a file
        #[arg(long)]
        properties: String,
    },
    /// Detach the volume with the given LUN WWN
    Disconnect {
        #[arg(long)]
        wwn: String,
    },
}

fn load_properties(arg: &str) -> Result<Properties, Box<dyn std::error::Error + Send + Sync>> {
    let json = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&json)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
    };

    // stdout carries the device path
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(addr) = args.metrics_addr {
        metrics::init_metrics(addr)?;
    }

    let config = ConnectorConfig {
        sysfs_root: args.sysfs_root.clone(),
        command_timeout: Duration::from_secs(args.command_timeout),
        portal_probe_timeout: (args.portal_probe_timeout > 0)
            .then(|| Duration::from_secs(args.portal_probe_timeout)),
        ..ConnectorConfig::default()
    };

    info!(
        protocol = %args.protocol,
        sysfs_root = %args.sysfs_root.display(),
        "Starting iSCSI connector"
    );

    let registry = ConnectorRegistry::with_defaults(config, Arc::new(SystemRunner));
    let connector = registry.for_tag(&args.protocol)?;

    match args.command {
        Command::Connect { properties } => {
            let properties = load_properties(&properties)?;
            let device = connector.connect_volume(&properties).await?;
            println!("{}", device);
        }
        Command::Disconnect { wwn } => {
            connector.disconnect_volume(&wwn).await?;
            info!(wwn = %wwn, "Volume disconnected");
        }
    }

    Ok(())
}
