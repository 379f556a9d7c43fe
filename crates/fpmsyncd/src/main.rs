//! FPM Synchronization Daemon
//!
//! Main entry point for the fpmsyncd daemon.
//! Accepts the routing daemon's FPM connection and synchronizes routes and
//! neighbors to SONiC databases.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - Config file and command line overrides
//! - SI-4: System Monitoring - Real-time event processing

use anyhow::Context;
use clap::Parser;
use sonic_fpmsyncd::config::DEFAULT_CONFIG_PATH;
use sonic_fpmsyncd::{FpmSyncd, FpmsyncConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tracing::{error, info, warn};

/// SONiC FPM route synchronization daemon
#[derive(Parser, Debug)]
#[command(name = "fpmsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// FPM listener port (overrides the config file)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // NIST: AU-3, AU-12 - Audit logging setup
    if let Err(e) = init_logging(&args.log_level, args.json_logs) {
        eprintln!("fpmsyncd: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("fpmsyncd: Starting FPM synchronization daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("fpmsyncd: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "fpmsyncd: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over `--log-level`.
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(log_level: &str, json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("invalid log level '{}'", log_level))?;

    let layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer.compact()).try_init()
    }
    .context("failed to install log subscriber")
}

/// Main daemon loop
///
/// # NIST Controls
/// - SI-4: System Monitoring - Event loop for monitoring
async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let mut config = FpmsyncConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.fpm.port = port;
    }
    config.validate().context("invalid configuration")?;

    info!(
        config = %args.config.display(),
        fpm = %config.fpm.socket_addr(),
        appl_db = %config.database.appl_db_url(),
        "fpmsyncd: Configuration loaded"
    );

    let shutdown = setup_signal_handlers();

    let mut daemon = FpmSyncd::connect(&config).context("failed to start fpmsyncd")?;
    info!("fpmsyncd: Waiting for FPM connections...");

    daemon.run(&shutdown).await;

    let stats = daemon.link().borrow().stats();
    info!(
        connections = stats.connections_accepted,
        messages = stats.messages_processed,
        decode_errors = stats.decode_errors,
        "fpmsyncd: Graceful shutdown complete"
    );
    Ok(())
}

/// Setup signal handlers for graceful shutdown
///
/// # NIST Controls
/// - AU-12: Audit Record Generation - Log shutdown signals
fn setup_signal_handlers() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "fpmsyncd: Cannot install SIGTERM handler");
                if signal::ctrl_c().await.is_ok() {
                    info!("fpmsyncd: Received SIGINT");
                    shutdown_flag_clone.store(true, Ordering::Relaxed);
                }
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => info!("fpmsyncd: Received SIGINT"),
            _ = sigterm.recv() => info!("fpmsyncd: Received SIGTERM"),
        }
        shutdown_flag_clone.store(true, Ordering::Relaxed);
    });

    shutdown_flag
}
