//! Manual route resync marker control
//!
//! `routeresync start` asks the route consumer to begin a full resync by
//! writing the `resync` marker into ROUTE_TABLE; `routeresync stop` removes
//! it again.

use crate::error::Result;
use crate::producer_table::ProducerTable;
use crate::route_sync::{RESYNC_KEY, RESYNC_NEXTHOP};
use clap::ValueEnum;
use tracing::info;

/// Marker operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResyncOp {
    /// Set the resync marker
    Start,
    /// Remove the resync marker
    Stop,
}

/// Apply `op` to the route table.
pub fn apply(op: ResyncOp, table: &mut dyn ProducerTable) -> Result<()> {
    match op {
        ResyncOp::Start => {
            table.set(
                RESYNC_KEY,
                &[("nexthop".to_string(), RESYNC_NEXTHOP.to_string())],
            )?;
            info!(table = table.name(), "Route resync started");
        }
        ResyncOp::Stop => {
            table.del(RESYNC_KEY)?;
            info!(table = table.name(), "Route resync stopped");
        }
    }
    Ok(())
}
