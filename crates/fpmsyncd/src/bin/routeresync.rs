//! routeresync - start or stop a manual route resync
//!
//! Writes or removes the `resync` marker in APPL_DB ROUTE_TABLE.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-12: Audit Record Generation - Log operator resync requests
//! - CP-10: System Recovery - Operator-driven route reconciliation

use anyhow::Context;
use clap::Parser;
use sonic_fpmsyncd::config::DEFAULT_CONFIG_PATH;
use sonic_fpmsyncd::producer_table::{RedisProducerTable, APP_ROUTE_TABLE_NAME};
use sonic_fpmsyncd::resync::{self, ResyncOp};
use sonic_fpmsyncd::FpmsyncConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Start or stop a route resync
#[derive(Parser, Debug)]
#[command(name = "routeresync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Marker operation
    #[arg(value_enum)]
    op: ResyncOp,

    /// Configuration file (for the APPL_DB location)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt().with_target(false).compact().init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "routeresync failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = FpmsyncConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut table =
        RedisProducerTable::connect(&config.database.appl_db_url(), APP_ROUTE_TABLE_NAME)
            .context("connecting to APPL_DB")?;
    resync::apply(args.op, &mut table)?;
    Ok(())
}
