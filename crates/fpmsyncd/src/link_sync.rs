//! LinkSync - interface cache maintained from RTM_NEWLINK/RTM_DELLINK
//!
//! Route and neighbor messages only carry interface indexes. The routing
//! daemon streams link messages on the same FPM connection, and LinkSync keeps
//! the shared [`LinkCache`] that the other handlers use to resolve names and
//! VRF membership.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Track interface names and VRF membership

use crate::dispatcher::NetlinkHandler;
use crate::error::{FpmError, Result};
use crate::netlink::{DecodedNetlinkObject, RTM_DELLINK, RTM_NEWLINK};
use crate::types::LinkHeader;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, instrument};

pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_MASTER: u16 = 10;
pub const IFLA_LINKINFO: u16 = 18;
pub const IFLA_INFO_KIND: u16 = 1;
pub const IFLA_INFO_DATA: u16 = 2;
pub const IFLA_VRF_TABLE: u16 = 1;

/// One cached interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub name: String,
    /// Index of the enslaving device (VRF or bridge), if any
    pub master: Option<u32>,
    /// Routing table id when this link is a VRF device
    pub vrf_table: Option<u32>,
}

/// Interface index cache shared by the netlink handlers.
#[derive(Debug, Default)]
pub struct LinkCache {
    links: HashMap<u32, LinkEntry>,
}

/// Shared handle to the link cache.
pub type SharedLinkCache = Rc<RefCell<LinkCache>>;

impl LinkCache {
    pub fn shared() -> SharedLinkCache {
        Rc::new(RefCell::new(Self::default()))
    }

    pub fn insert(&mut self, ifindex: u32, entry: LinkEntry) {
        self.links.insert(ifindex, entry);
    }

    pub fn remove(&mut self, ifindex: u32) -> Option<LinkEntry> {
        self.links.remove(&ifindex)
    }

    pub fn get(&self, ifindex: u32) -> Option<&LinkEntry> {
        self.links.get(&ifindex)
    }

    /// Look up interface name by index
    pub fn name(&self, ifindex: u32) -> Option<&str> {
        self.links.get(&ifindex).map(|l| l.name.as_str())
    }

    /// Interface name, or [`FpmError::UnknownInterface`]
    pub fn resolve(&self, ifindex: u32) -> Result<&str> {
        self.name(ifindex)
            .ok_or(FpmError::UnknownInterface(ifindex))
    }

    /// Name of the VRF device bound to routing table `table`
    pub fn vrf_for_table(&self, table: u32) -> Option<&str> {
        self.links
            .values()
            .find(|l| l.vrf_table == Some(table))
            .map(|l| l.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Handler for Link messages.
#[derive(Debug)]
pub struct LinkSync {
    cache: SharedLinkCache,
}

impl LinkSync {
    pub fn new(cache: SharedLinkCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &SharedLinkCache {
        &self.cache
    }

    fn parse_entry(msg: &DecodedNetlinkObject<'_>) -> Result<LinkEntry> {
        let name = msg
            .attribute(IFLA_IFNAME)
            .ok_or(FpmError::MissingAttribute {
                attribute: "IFLA_IFNAME",
                context: "RTM_NEWLINK",
            })?
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FpmError::InvalidAttribute {
                attribute: "IFLA_IFNAME",
                reason: "not a UTF-8 name".to_string(),
            })?
            .to_string();

        let master = msg.attribute(IFLA_MASTER).and_then(|a| a.as_u32());

        let mut vrf_table = None;
        if let Some(linkinfo) = msg.attribute(IFLA_LINKINFO) {
            let info = linkinfo.nested()?;
            let is_vrf = info
                .iter()
                .any(|a| a.kind() == IFLA_INFO_KIND && a.as_str() == Some("vrf"));
            if is_vrf {
                if let Some(data) = info.iter().find(|a| a.kind() == IFLA_INFO_DATA) {
                    vrf_table = data
                        .nested()?
                        .iter()
                        .find(|a| a.kind() == IFLA_VRF_TABLE)
                        .and_then(|a| a.as_u32());
                }
            }
        }

        Ok(LinkEntry {
            name,
            master,
            vrf_table,
        })
    }
}

impl NetlinkHandler for LinkSync {
    fn name(&self) -> &str {
        "link_sync"
    }

    #[instrument(skip_all, fields(message_type = msg.header.message_type))]
    fn on_netlink_message(&mut self, msg: &DecodedNetlinkObject<'_>) -> Result<()> {
        let header = LinkHeader::parse(msg.family_header).ok_or(FpmError::InvalidAttribute {
            attribute: "ifinfomsg",
            reason: format!("{} bytes", msg.family_header.len()),
        })?;

        match msg.header.message_type {
            RTM_NEWLINK => {
                let entry = Self::parse_entry(msg)?;
                debug!(
                    ifindex = header.index,
                    name = %entry.name,
                    master = ?entry.master,
                    vrf_table = ?entry.vrf_table,
                    "Link updated"
                );
                self.cache.borrow_mut().insert(header.index, entry);
            }
            RTM_DELLINK => {
                if let Some(entry) = self.cache.borrow_mut().remove(header.index) {
                    info!(ifindex = header.index, name = %entry.name, "Link removed");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Encode a NEWLINK/DELLINK message for `ifindex`.
///
/// `vrf_table` marks the link as a VRF device bound to that table.
pub fn link_message(
    message_type: u16,
    ifindex: u32,
    name: &str,
    master: Option<u32>,
    vrf_table: Option<u32>,
) -> Vec<u8> {
    use crate::netlink::{emit_attribute, NetlinkMessageBuilder};

    let mut builder = NetlinkMessageBuilder::new(message_type)
        .family_header(&LinkHeader::with_index(ifindex).to_bytes())
        .str_attribute(IFLA_IFNAME, name);
    if let Some(master) = master {
        builder = builder.u32_attribute(IFLA_MASTER, master);
    }
    if let Some(table) = vrf_table {
        let mut data = Vec::new();
        emit_attribute(&mut data, IFLA_VRF_TABLE, &table.to_ne_bytes());
        let mut info = Vec::new();
        emit_attribute(&mut info, IFLA_INFO_KIND, b"vrf\0");
        emit_attribute(&mut info, IFLA_INFO_DATA | netlink_packet_core::NLA_F_NESTED, &data);
        builder = builder.nested_attribute(IFLA_LINKINFO, &info);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::{NetlinkDecoder, NetlinkMessageBuilder};

    fn apply(sync: &mut LinkSync, bytes: &[u8]) -> Result<()> {
        let msg = NetlinkDecoder::new().decode(bytes).unwrap();
        sync.on_netlink_message(&msg)
    }

    #[test]
    fn test_newlink_populates_cache() {
        let cache = LinkCache::shared();
        let mut sync = LinkSync::new(cache.clone());

        apply(&mut sync, &link_message(RTM_NEWLINK, 5, "Ethernet0", Some(9), None)).unwrap();
        let cache = cache.borrow();
        assert_eq!(cache.name(5), Some("Ethernet0"));
        assert_eq!(cache.get(5).unwrap().master, Some(9));
        assert_eq!(cache.resolve(6).unwrap_err().to_string(), "Interface not found: index 6");
    }

    #[test]
    fn test_vrf_link_records_table() {
        let cache = LinkCache::shared();
        let mut sync = LinkSync::new(cache.clone());

        apply(&mut sync, &link_message(RTM_NEWLINK, 9, "Vrf-red", None, Some(1001))).unwrap();
        assert_eq!(cache.borrow().get(9).unwrap().vrf_table, Some(1001));
        assert_eq!(cache.borrow().vrf_for_table(1001), Some("Vrf-red"));
        assert_eq!(cache.borrow().vrf_for_table(1002), None);
    }

    #[test]
    fn test_dellink_removes_entry() {
        let cache = LinkCache::shared();
        let mut sync = LinkSync::new(cache.clone());

        apply(&mut sync, &link_message(RTM_NEWLINK, 5, "Ethernet0", None, None)).unwrap();
        apply(&mut sync, &link_message(RTM_DELLINK, 5, "Ethernet0", None, None)).unwrap();
        assert!(cache.borrow().is_empty());
    }

    #[test]
    fn test_newlink_without_name_is_rejected() {
        let mut sync = LinkSync::new(LinkCache::shared());
        let bytes = NetlinkMessageBuilder::new(RTM_NEWLINK)
            .family_header(&LinkHeader::with_index(3).to_bytes())
            .build();
        let err = apply(&mut sync, &bytes).unwrap_err();
        assert!(matches!(
            err,
            FpmError::MissingAttribute {
                attribute: "IFLA_IFNAME",
                ..
            }
        ));
        assert!(sync.cache().borrow().is_empty());
    }
}
