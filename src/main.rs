//! tcplb: TCP/UDP load balancer with hot reload.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────────────────────────────────────────┐
//!   SIGHUP ──────▶│ lifecycle::Manager                            │
//!   SIGTERM ─────▶│   reload / graceful stop / forced stop        │
//!   config change▶│                                               │
//!                 │   ┌──────────── one per listener ──────────┐  │
//!   Client ──────▶│   │ proxy::Proxy                           │  │
//!                 │   │   net::listener (accept, limits)       │  │
//!                 │   │   net::tls (optional termination)      │  │
//!                 │   │   load_balancer (RoundRobin |          │──┼──▶ Backend
//!                 │   │     ClientHash | LeastConn)            │  │
//!                 │   │   proxy::pipe / proxy::udp             │  │
//!                 │   └────────────────────────────────────────┘  │
//!                 └───────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use tcplb::config::load_config;
use tcplb::lifecycle::signals::spawn_signal_listener;
use tcplb::observability::logging;
use tcplb::{ConfigSource, Manager, ManagerOptions, Proxy, ProxyOptions, Termination};

#[derive(Parser, Debug)]
#[command(name = "tcplb", version)]
#[command(about = "TCP/UDP load balancer with TLS termination and hot reload", long_about = None)]
struct Cli {
    /// Configuration file path or http(s) URL
    #[arg(short, long)]
    config: String,

    /// Write the process id to this file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Reload when the local configuration file changes
    #[arg(long)]
    watch: bool,

    /// Poll the configuration source every N seconds (URLs default to 10)
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Abort connections still open N seconds after a proxy stops
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Log level for this crate, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Validate the configuration and TLS material, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_level.as_deref(), cli.log_json) {
        eprintln!("failed to initialize logging: {e}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let source = ConfigSource::parse(&cli.config);
    let proxy_options = ProxyOptions {
        drain_timeout: cli.drain_timeout_secs.map(Duration::from_secs),
        ..ProxyOptions::default()
    };

    if cli.check {
        let loaded = load_config(&source).await?;
        for spec in &loaded.config.listeners {
            Proxy::new(spec.clone(), proxy_options)?;
        }
        tracing::info!(
            source = %source,
            listeners = loaded.config.listeners.len(),
            digest = %loaded.digest,
            "Configuration OK"
        );
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(path) = &cli.pid_file {
        write_pid_file(path)?;
        tracing::info!(pid = std::process::id(), path = ?path, "PID written");
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), source = %source, "tcplb starting");

    let manager = Manager::new(
        source,
        ManagerOptions {
            proxy: proxy_options,
            poll_interval: cli.poll_interval_secs.map(Duration::from_secs),
            watch_file: cli.watch,
        },
    );
    manager.start().await?;
    let _signals = spawn_signal_listener(manager.signal_sender())?;

    match manager.wait().await {
        Termination::Graceful => {
            tracing::info!("Terminating");
            Ok(ExitCode::SUCCESS)
        }
        Termination::Forced => {
            tracing::warn!(pid = std::process::id(), "Forced stop");
            std::process::exit(1);
        }
        Termination::Failed(reason) => {
            tracing::error!(reason = %reason, "Terminating after failed reload");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(std::process::id().to_string().as_bytes())
}
