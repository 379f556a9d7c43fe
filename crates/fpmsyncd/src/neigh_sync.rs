//! NeighSync - publishes FPM neighbor updates to APPL_DB NEIGH_TABLE
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Neighbor table monitoring
//! - AU-12: Audit Record Generation - Log all neighbor changes
//! - SC-5: Denial of Service Protection - Filter broadcast and multicast entries
//! - CM-8: System Component Inventory - Track network neighbors

use crate::dispatcher::NetlinkHandler;
use crate::error::{FpmError, Result};
use crate::link_sync::SharedLinkCache;
use crate::netlink::{DecodedNetlinkObject, NetlinkMessageBuilder, RTM_DELNEIGH, RTM_NEWNEIGH};
use crate::producer_table::ProducerTable;
use crate::types::{family_str, MacAddress, NeighborHeader, NeighborState, AF_INET, AF_INET6};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, instrument, trace};

pub const NDA_DST: u16 = 1;
pub const NDA_LLADDR: u16 = 2;

/// NTF_EXT_LEARNED
const NTF_EXT_LEARNED: u8 = 0x10;

/// Handler for Neighbor messages.
pub struct NeighSync {
    table: Box<dyn ProducerTable>,
    links: SharedLinkCache,
    /// Published key per (ifindex, ip), so a delete still finds its entry
    /// after the interface has left the link cache.
    published: HashMap<(u32, IpAddr), String>,
}

impl NeighSync {
    pub fn new(table: Box<dyn ProducerTable>, links: SharedLinkCache) -> Self {
        Self {
            table,
            links,
            published: HashMap::new(),
        }
    }

    /// Number of neighbors currently published.
    pub fn published_count(&self) -> usize {
        self.published.len()
    }

    /// Check if a neighbor entry should be processed
    ///
    /// # NIST Controls
    /// - SC-5: Denial of Service Protection - Filter invalid entries
    fn should_process(ip: &IpAddr, header: &NeighborHeader) -> bool {
        if let IpAddr::V6(v6) = ip {
            if v6.segments()[0] == 0xff02 {
                debug!(ip = %ip, "Ignoring IPv6 multicast link-local");
                return false;
            }
        }

        if header.state == NeighborState::NoArp && header.flags & NTF_EXT_LEARNED == 0 {
            debug!(ip = %ip, "Ignoring NOARP entry (not externally learned)");
            return false;
        }

        true
    }
}

impl NetlinkHandler for NeighSync {
    fn name(&self) -> &str {
        "neigh_sync"
    }

    #[instrument(skip_all, fields(message_type = msg.header.message_type))]
    fn on_netlink_message(&mut self, msg: &DecodedNetlinkObject<'_>) -> Result<()> {
        let header = NeighborHeader::parse(msg.family_header).ok_or(FpmError::InvalidAttribute {
            attribute: "ndmsg",
            reason: format!("{} bytes", msg.family_header.len()),
        })?;
        if header.family != AF_INET && header.family != AF_INET6 {
            trace!(family = header.family, "Ignoring non-IP neighbor");
            return Ok(());
        }

        let ip = msg
            .attribute(NDA_DST)
            .ok_or(FpmError::MissingAttribute {
                attribute: "NDA_DST",
                context: "neighbor message",
            })?
            .as_ip()
            .ok_or_else(|| FpmError::InvalidAttribute {
                attribute: "NDA_DST",
                reason: "not an IP address".to_string(),
            })?;

        if !Self::should_process(&ip, &header) {
            return Ok(());
        }

        let slot = (header.ifindex, ip);
        let resolved = self
            .links
            .borrow()
            .resolve(header.ifindex)
            .map(str::to_string);
        let is_delete = msg.header.message_type == RTM_DELNEIGH
            || matches!(header.state, NeighborState::Incomplete | NeighborState::Failed);

        if is_delete {
            let key = match (self.published.get(&slot), resolved) {
                (Some(key), _) => key.clone(),
                (None, Ok(ifname)) => format!("{}:{}", ifname, ip),
                (None, Err(e)) => return Err(e),
            };
            self.table.del(&key)?;
            self.published.remove(&slot);
            info!(key = %key, "Deleted neighbor");
            return Ok(());
        }

        let ifname = resolved?;
        let key = format!("{}:{}", ifname, ip);

        let mac = msg
            .attribute(NDA_LLADDR)
            .and_then(|a| MacAddress::from_bytes(a.value()))
            .unwrap_or(MacAddress::ZERO);

        if mac.is_zero() {
            debug!(ip = %ip, "Ignoring add with zero MAC");
            return Ok(());
        }
        if mac.is_broadcast() {
            debug!(ip = %ip, "Ignoring broadcast MAC");
            return Ok(());
        }

        self.table.set(
            &key,
            &[
                ("neigh".to_string(), mac.to_string()),
                ("family".to_string(), family_str(&ip).to_string()),
            ],
        )?;
        info!(interface = %ifname, ip = %ip, mac = %mac, "Set neighbor");
        self.published.insert(slot, key);
        Ok(())
    }
}

/// Encode a neighbor message.
pub fn neighbor_message(
    message_type: u16,
    ifindex: u32,
    ip: IpAddr,
    mac: Option<MacAddress>,
    state: NeighborState,
) -> Vec<u8> {
    let header = NeighborHeader {
        family: if ip.is_ipv4() { AF_INET } else { AF_INET6 },
        ifindex,
        state,
        flags: 0,
        neigh_type: 1,
    };
    let mut builder = NetlinkMessageBuilder::new(message_type)
        .family_header(&header.to_bytes())
        .ip_attribute(NDA_DST, ip);
    if let Some(mac) = mac {
        builder = builder.attribute(NDA_LLADDR, &mac.0);
    }
    builder.build()
}

/// Convenience for RTM_NEWNEIGH.
pub fn new_neighbor_message(ifindex: u32, ip: IpAddr, mac: MacAddress) -> Vec<u8> {
    neighbor_message(RTM_NEWNEIGH, ifindex, ip, Some(mac), NeighborState::Reachable)
}
