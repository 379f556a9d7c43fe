//! RouteSync - publishes FPM route updates to APPL_DB ROUTE_TABLE
//!
//! Unicast routes become `nexthop`/`ifname` entries (comma-joined for ECMP),
//! blackhole style routes become `blackhole=true`. Routes in a VRF table are
//! keyed by the VRF device name.
//!
//! A full route dump from the routing daemon (messages flagged
//! NLM_F_MULTI, terminated by NLMSG_DONE) is reconciled against the routes
//! already installed: routes not refreshed by the dump are withdrawn when it
//! ends. The `resync` marker brackets the dump so consumers can hold off.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-3: Configuration Change Control - Route table updates
//! - CP-10: System Recovery - Dump reconciliation after peer restart
//! - AU-12: Audit Record Generation - Route changes logged

use crate::config::RoutingConfig;
use crate::dispatcher::NetlinkHandler;
use crate::error::{FpmError, Result};
use crate::link_sync::SharedLinkCache;
use crate::netlink::{
    parse_attributes, Attribute, DecodedNetlinkObject, MessageKind, NetlinkMessageBuilder,
    RTM_DELROUTE, RTM_NEWROUTE,
};
use crate::producer_table::{FieldValues, ProducerTable};
use crate::select::PeriodicTask;
use crate::types::{unspecified_for, RouteHeader, RouteType, AF_INET, AF_INET6, RT_TABLE_MAIN};
use byteorder::{ByteOrder, NativeEndian};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

pub const RTA_DST: u16 = 1;
pub const RTA_OIF: u16 = 4;
pub const RTA_GATEWAY: u16 = 5;
pub const RTA_PRIORITY: u16 = 6;
pub const RTA_MULTIPATH: u16 = 9;
pub const RTA_TABLE: u16 = 15;

/// Key of the resync marker in ROUTE_TABLE
pub const RESYNC_KEY: &str = "resync";

/// Field value of the resync marker
pub const RESYNC_NEXTHOP: &str = "0.0.0.0";

/// Size of `struct rtnexthop`
const RTNEXTHOP_LEN: usize = 8;

/// Route handler counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteStats {
    pub routes_set: u64,
    pub routes_deleted: u64,
    pub routes_ignored: u64,
    pub dumps_completed: u64,
    pub stale_withdrawn: u64,
}

/// One resolved next hop.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NextHop {
    gateway: IpAddr,
    ifname: String,
}

#[derive(Debug)]
struct DumpState {
    started: Instant,
    stale: HashSet<String>,
}

/// Handler for Route and Done messages.
pub struct RouteSync {
    table: Box<dyn ProducerTable>,
    links: SharedLinkCache,
    ignored_interfaces: HashSet<String>,
    installed: HashMap<String, FieldValues>,
    dump: Option<DumpState>,
    dump_timeout: Duration,
    stats: RouteStats,
}

impl RouteSync {
    pub fn new(
        table: Box<dyn ProducerTable>,
        links: SharedLinkCache,
        config: &RoutingConfig,
    ) -> Self {
        Self {
            table,
            links,
            ignored_interfaces: config.ignored_interfaces.iter().cloned().collect(),
            installed: HashMap::new(),
            dump: None,
            dump_timeout: Duration::from_secs(config.dump_timeout_secs),
            stats: RouteStats::default(),
        }
    }

    pub fn stats(&self) -> RouteStats {
        self.stats
    }

    /// True while a full route dump is being received.
    pub fn in_dump(&self) -> bool {
        self.dump.is_some()
    }

    /// Installed entry for `key`.
    pub fn installed(&self, key: &str) -> Option<&FieldValues> {
        self.installed.get(key)
    }

    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }

    fn begin_dump(&mut self) -> Result<()> {
        let stale: HashSet<String> = self.installed.keys().cloned().collect();
        info!(installed = stale.len(), "Route dump started, resync begins");
        self.table.set(
            RESYNC_KEY,
            &[("nexthop".to_string(), RESYNC_NEXTHOP.to_string())],
        )?;
        self.dump = Some(DumpState {
            started: Instant::now(),
            stale,
        });
        Ok(())
    }

    /// Withdraw every route the dump did not refresh and clear the marker.
    ///
    /// A failed delete leaves the dump open with the keys still pending, so
    /// the next NLMSG_DONE or dump timeout retries them.
    fn finish_dump(&mut self) -> Result<()> {
        let Some(mut dump) = self.dump.take() else {
            trace!("NLMSG_DONE outside a route dump");
            return Ok(());
        };

        let table = &mut self.table;
        let installed = &mut self.installed;
        let mut withdrawn = 0u64;
        let mut failure = None;
        dump.stale.retain(|key| match table.del(key) {
            Ok(()) => {
                installed.remove(key);
                withdrawn += 1;
                false
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to withdraw stale route");
                if failure.is_none() {
                    failure = Some(e);
                }
                true
            }
        });
        self.stats.stale_withdrawn += withdrawn;

        if failure.is_none() {
            if let Err(e) = self.table.del(RESYNC_KEY) {
                failure = Some(e);
            }
        }
        if let Some(e) = failure {
            warn!(
                pending = dump.stale.len(),
                "Route dump reconciliation incomplete, will retry"
            );
            self.dump = Some(dump);
            return Err(e);
        }

        self.stats.dumps_completed += 1;
        info!(
            withdrawn,
            installed = self.installed.len(),
            elapsed_ms = dump.started.elapsed().as_millis() as u64,
            "Route dump finished, resync complete"
        );
        Ok(())
    }

    fn route_key(
        &self,
        msg: &DecodedNetlinkObject<'_>,
        header: &RouteHeader,
    ) -> Result<Option<String>> {
        let table = match msg.attribute(RTA_TABLE) {
            Some(attr) => u32_value(attr, "RTA_TABLE")?,
            None => header.table as u32,
        };

        let vrf = if table == RT_TABLE_MAIN {
            None
        } else {
            match self.links.borrow().vrf_for_table(table) {
                Some(name) => Some(name.to_string()),
                None => {
                    debug!(table, "Ignoring route in unknown table");
                    return Ok(None);
                }
            }
        };

        let dst = match msg.attribute(RTA_DST) {
            Some(attr) => ip_value(attr, "RTA_DST")?,
            None => unspecified_for(header.family),
        };
        let max_len = if dst.is_ipv4() { 32 } else { 128 };
        if header.dst_len > max_len {
            return Err(FpmError::InvalidAttribute {
                attribute: "rtm_dst_len",
                reason: format!("{} exceeds {}", header.dst_len, max_len),
            });
        }

        let prefix = format!("{}/{}", dst, header.dst_len);
        Ok(Some(match vrf {
            Some(vrf) => format!("{}:{}", vrf, prefix),
            None => prefix,
        }))
    }

    fn next_hops(&self, msg: &DecodedNetlinkObject<'_>, family: u8) -> Result<Vec<NextHop>> {
        let links = self.links.borrow();
        let mut hops = Vec::new();

        if let Some(multipath) = msg.attribute(RTA_MULTIPATH) {
            for (ifindex, gateway) in parse_multipath(multipath.value())? {
                hops.push(NextHop {
                    gateway: gateway.unwrap_or_else(|| unspecified_for(family)),
                    ifname: links.resolve(ifindex)?.to_string(),
                });
            }
        } else {
            let oif = msg.attribute(RTA_OIF).ok_or(FpmError::MissingAttribute {
                attribute: "RTA_OIF",
                context: "RTM_NEWROUTE",
            })?;
            let ifindex = u32_value(oif, "RTA_OIF")?;
            let gateway = match msg.attribute(RTA_GATEWAY) {
                Some(attr) => ip_value(attr, "RTA_GATEWAY")?,
                None => unspecified_for(family),
            };
            hops.push(NextHop {
                gateway,
                ifname: links.resolve(ifindex)?.to_string(),
            });
        }

        Ok(hops)
    }

    fn on_new_route(
        &mut self,
        key: String,
        msg: &DecodedNetlinkObject<'_>,
        header: &RouteHeader,
    ) -> Result<()> {
        let fvs: FieldValues = match header.route_type {
            t if t.is_drop() => vec![("blackhole".to_string(), "true".to_string())],
            RouteType::Unicast => {
                let hops: Vec<NextHop> = self
                    .next_hops(msg, header.family)?
                    .into_iter()
                    .filter(|h| !self.ignored_interfaces.contains(&h.ifname))
                    .collect();
                if hops.is_empty() {
                    debug!(key = %key, "Ignoring route on ignored interfaces");
                    self.stats.routes_ignored += 1;
                    return Ok(());
                }
                let nexthop = hops
                    .iter()
                    .map(|h| h.gateway.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let ifname = hops
                    .iter()
                    .map(|h| h.ifname.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                vec![
                    ("nexthop".to_string(), nexthop),
                    ("ifname".to_string(), ifname),
                ]
            }
            other => {
                debug!(key = %key, route_type = ?other, "Ignoring route type");
                self.stats.routes_ignored += 1;
                return Ok(());
            }
        };

        debug!(key = %key, fields = ?fvs, "Route set");
        self.table.set(&key, &fvs)?;
        self.stats.routes_set += 1;
        if let Some(dump) = &mut self.dump {
            dump.stale.remove(&key);
        }
        self.installed.insert(key, fvs);
        Ok(())
    }

    fn on_del_route(&mut self, key: String) -> Result<()> {
        debug!(key = %key, "Route deleted");
        self.table.del(&key)?;
        self.stats.routes_deleted += 1;
        if let Some(dump) = &mut self.dump {
            dump.stale.remove(&key);
        }
        self.installed.remove(&key);
        Ok(())
    }
}

impl NetlinkHandler for RouteSync {
    fn name(&self) -> &str {
        "route_sync"
    }

    #[instrument(
        skip_all,
        fields(message_type = msg.header.message_type, seq = msg.header.sequence)
    )]
    fn on_netlink_message(&mut self, msg: &DecodedNetlinkObject<'_>) -> Result<()> {
        if msg.kind == Some(MessageKind::Done) {
            return self.finish_dump();
        }

        let header = RouteHeader::parse(msg.family_header).ok_or(FpmError::InvalidAttribute {
            attribute: "rtmsg",
            reason: format!("{} bytes", msg.family_header.len()),
        })?;
        if header.family != AF_INET && header.family != AF_INET6 {
            trace!(family = header.family, "Ignoring non-IP route");
            return Ok(());
        }

        if msg.is_dump_part() && self.dump.is_none() {
            self.begin_dump()?;
        }

        let Some(key) = self.route_key(msg, &header)? else {
            self.stats.routes_ignored += 1;
            return Ok(());
        };

        match msg.header.message_type {
            RTM_NEWROUTE => self.on_new_route(key, msg, &header),
            RTM_DELROUTE => self.on_del_route(key),
            _ => Ok(()),
        }
    }
}

impl PeriodicTask for RouteSync {
    fn name(&self) -> &str {
        "route_dump_timeout"
    }

    fn on_timeout(&mut self) -> Result<()> {
        let expired = self
            .dump
            .as_ref()
            .is_some_and(|d| d.started.elapsed() >= self.dump_timeout);
        if expired {
            warn!(
                timeout_secs = self.dump_timeout.as_secs(),
                "Route dump did not finish in time, reconciling now"
            );
            self.finish_dump()?;
        }
        Ok(())
    }
}

fn u32_value(attr: &Attribute<'_>, name: &'static str) -> Result<u32> {
    attr.as_u32().ok_or_else(|| FpmError::InvalidAttribute {
        attribute: name,
        reason: format!("expected 4 bytes, got {}", attr.value().len()),
    })
}

fn ip_value(attr: &Attribute<'_>, name: &'static str) -> Result<IpAddr> {
    attr.as_ip().ok_or_else(|| FpmError::InvalidAttribute {
        attribute: name,
        reason: format!("expected 4 or 16 bytes, got {}", attr.value().len()),
    })
}

/// Parse an RTA_MULTIPATH value into `(ifindex, gateway)` pairs.
fn parse_multipath(value: &[u8]) -> Result<Vec<(u32, Option<IpAddr>)>> {
    let mut hops = Vec::new();
    let mut offset = 0;
    while value.len() - offset >= RTNEXTHOP_LEN {
        let len = NativeEndian::read_u16(&value[offset..offset + 2]) as usize;
        if len < RTNEXTHOP_LEN || len > value.len() - offset {
            return Err(FpmError::InvalidAttribute {
                attribute: "RTA_MULTIPATH",
                reason: format!("next hop length {} at offset {}", len, offset),
            });
        }
        let ifindex = NativeEndian::read_u32(&value[offset + 4..offset + 8]);
        let attrs = parse_attributes(&value[offset + RTNEXTHOP_LEN..offset + len])?;
        let gateway = match attrs.iter().find(|a| a.kind() == RTA_GATEWAY) {
            Some(attr) => Some(ip_value(attr, "RTA_GATEWAY")?),
            None => None,
        };
        hops.push((ifindex, gateway));
        offset += (len + 3) & !3;
        offset = offset.min(value.len());
    }
    Ok(hops)
}

/// Encode an RTA_MULTIPATH value from `(ifindex, gateway)` pairs.
pub fn multipath_value(hops: &[(u32, Option<IpAddr>)]) -> Vec<u8> {
    use crate::netlink::emit_attribute;

    let mut out = Vec::new();
    for (ifindex, gateway) in hops {
        let mut attrs = Vec::new();
        match gateway {
            Some(IpAddr::V4(v4)) => emit_attribute(&mut attrs, RTA_GATEWAY, &v4.octets()),
            Some(IpAddr::V6(v6)) => emit_attribute(&mut attrs, RTA_GATEWAY, &v6.octets()),
            None => {}
        }
        let mut nh = [0u8; RTNEXTHOP_LEN];
        NativeEndian::write_u16(&mut nh[0..2], (RTNEXTHOP_LEN + attrs.len()) as u16);
        NativeEndian::write_u32(&mut nh[4..8], *ifindex);
        out.extend_from_slice(&nh);
        out.extend_from_slice(&attrs);
    }
    out
}

/// Start a route message for `dst`/`dst_len` in the main table.
///
/// The default route is encoded without RTA_DST, as the kernel does.
pub fn route_builder(message_type: u16, dst: IpAddr, dst_len: u8) -> NetlinkMessageBuilder {
    let family = if dst.is_ipv4() { AF_INET } else { AF_INET6 };
    let builder = NetlinkMessageBuilder::new(message_type)
        .family_header(&RouteHeader::unicast(family, dst_len).to_bytes());
    if dst_len == 0 && dst.is_unspecified() {
        builder
    } else {
        builder.ip_attribute(RTA_DST, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_sync::{LinkCache, LinkEntry};
    use crate::netlink::NetlinkDecoder;
    use crate::producer_table::{fvs, MemoryProducerTable, TableOp, APP_ROUTE_TABLE_NAME};
    use netlink_packet_core::{NLMSG_DONE, NLM_F_MULTIPART};
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::io;
    use std::rc::Rc;

    struct Fixture {
        sync: RouteSync,
        table: MemoryProducerTable,
        links: SharedLinkCache,
    }

    fn link(name: &str) -> LinkEntry {
        LinkEntry {
            name: name.to_string(),
            master: None,
            vrf_table: None,
        }
    }

    fn fixture() -> Fixture {
        let table = MemoryProducerTable::new(APP_ROUTE_TABLE_NAME);
        let links = LinkCache::shared();
        {
            let mut cache = links.borrow_mut();
            cache.insert(1, link("eth0"));
            cache.insert(2, link("Ethernet0"));
            cache.insert(3, link("Ethernet4"));
            cache.insert(
                10,
                LinkEntry {
                    vrf_table: Some(1001),
                    ..link("Vrf-red")
                },
            );
        }
        let sync = RouteSync::new(
            Box::new(table.clone()),
            links.clone(),
            &RoutingConfig::default(),
        );
        Fixture { sync, table, links }
    }

    /// Memory table whose next `fail_dels` deletes fail.
    #[derive(Clone)]
    struct FlakyTable {
        inner: MemoryProducerTable,
        fail_dels: Rc<Cell<usize>>,
    }

    impl ProducerTable for FlakyTable {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn set(&mut self, key: &str, fvs: &[(String, String)]) -> Result<()> {
            self.inner.set(key, fvs)
        }

        fn del(&mut self, key: &str) -> Result<()> {
            let pending = self.fail_dels.get();
            if pending > 0 {
                self.fail_dels.set(pending - 1);
                return Err(FpmError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "APPL_DB unavailable",
                )));
            }
            self.inner.del(key)
        }
    }

    fn flaky_sync(config: &RoutingConfig) -> (RouteSync, MemoryProducerTable, Rc<Cell<usize>>) {
        let table = MemoryProducerTable::new(APP_ROUTE_TABLE_NAME);
        let fail_dels = Rc::new(Cell::new(0));
        let flaky = FlakyTable {
            inner: table.clone(),
            fail_dels: fail_dels.clone(),
        };
        let sync = RouteSync::new(Box::new(flaky), fixture().links, config);
        (sync, table, fail_dels)
    }

    fn apply(sync: &mut RouteSync, bytes: &[u8]) -> Result<()> {
        let msg = NetlinkDecoder::new().decode(bytes).unwrap();
        sync.on_netlink_message(&msg)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn done() -> Vec<u8> {
        NetlinkMessageBuilder::new(NLMSG_DONE)
            .flags(NLM_F_MULTIPART)
            .family_header(&[0, 0, 0, 0])
            .build()
    }

    #[test]
    fn test_unicast_route_with_gateway() {
        let mut f = fixture();
        let bytes = route_builder(RTM_NEWROUTE, ip("10.1.0.0"), 16)
            .u32_attribute(RTA_OIF, 2)
            .ip_attribute(RTA_GATEWAY, ip("10.0.0.1"))
            .build();
        apply(&mut f.sync, &bytes).unwrap();

        assert_eq!(
            f.table.get("10.1.0.0/16"),
            Some(fvs([("nexthop", "10.0.0.1"), ("ifname", "Ethernet0")]))
        );
        assert_eq!(f.sync.stats().routes_set, 1);
    }

    #[test]
    fn test_connected_and_default_routes() {
        let mut f = fixture();
        let connected = route_builder(RTM_NEWROUTE, ip("2001:db8::"), 64)
            .u32_attribute(RTA_OIF, 3)
            .build();
        let default = route_builder(RTM_NEWROUTE, ip("0.0.0.0"), 0)
            .u32_attribute(RTA_OIF, 2)
            .ip_attribute(RTA_GATEWAY, ip("10.0.0.1"))
            .build();
        apply(&mut f.sync, &connected).unwrap();
        apply(&mut f.sync, &default).unwrap();

        assert_eq!(f.table.field("2001:db8::/64", "nexthop").as_deref(), Some("::"));
        assert_eq!(f.table.field("0.0.0.0/0", "ifname").as_deref(), Some("Ethernet0"));
    }

    #[test]
    fn test_multipath_route() {
        let mut f = fixture();
        let mp = multipath_value(&[(2, Some(ip("10.0.0.1"))), (3, Some(ip("10.0.1.1")))]);
        let bytes = route_builder(RTM_NEWROUTE, ip("192.168.0.0"), 24)
            .attribute(RTA_MULTIPATH, &mp)
            .build();
        apply(&mut f.sync, &bytes).unwrap();

        assert_eq!(
            f.table.get("192.168.0.0/24"),
            Some(fvs([
                ("nexthop", "10.0.0.1,10.0.1.1"),
                ("ifname", "Ethernet0,Ethernet4")
            ]))
        );
    }

    #[test]
    fn test_blackhole_route() {
        let mut f = fixture();
        let header = RouteHeader {
            route_type: RouteType::Blackhole,
            ..RouteHeader::unicast(AF_INET, 8)
        };
        let bytes = NetlinkMessageBuilder::new(RTM_NEWROUTE)
            .family_header(&header.to_bytes())
            .ip_attribute(RTA_DST, ip("10.0.0.0"))
            .build();
        apply(&mut f.sync, &bytes).unwrap();

        assert_eq!(f.table.get("10.0.0.0/8"), Some(fvs([("blackhole", "true")])));
    }

    #[test]
    fn test_vrf_route_is_prefixed() {
        let mut f = fixture();
        let bytes = route_builder(RTM_NEWROUTE, ip("10.9.0.0"), 16)
            .u32_attribute(RTA_TABLE, 1001)
            .u32_attribute(RTA_OIF, 2)
            .build();
        apply(&mut f.sync, &bytes).unwrap();
        assert!(f.table.get("Vrf-red:10.9.0.0/16").is_some());

        // Unknown tables are ignored.
        let other = route_builder(RTM_NEWROUTE, ip("10.8.0.0"), 16)
            .u32_attribute(RTA_TABLE, 77)
            .u32_attribute(RTA_OIF, 2)
            .build();
        apply(&mut f.sync, &other).unwrap();
        assert_eq!(f.table.len(), 1);
        assert_eq!(f.sync.stats().routes_ignored, 1);
    }

    #[test]
    fn test_missing_oif_and_unknown_interface() {
        let mut f = fixture();
        let no_oif = route_builder(RTM_NEWROUTE, ip("10.2.0.0"), 16).build();
        assert!(matches!(
            apply(&mut f.sync, &no_oif).unwrap_err(),
            FpmError::MissingAttribute { attribute: "RTA_OIF", .. }
        ));

        let unknown = route_builder(RTM_NEWROUTE, ip("10.3.0.0"), 16)
            .u32_attribute(RTA_OIF, 99)
            .build();
        assert!(matches!(
            apply(&mut f.sync, &unknown).unwrap_err(),
            FpmError::UnknownInterface(99)
        ));
        assert!(f.table.is_empty());
    }

    #[test]
    fn test_ignored_interface_route_skipped() {
        let mut f = fixture();
        let bytes = route_builder(RTM_NEWROUTE, ip("172.17.0.0"), 16)
            .u32_attribute(RTA_OIF, 1)
            .build();
        apply(&mut f.sync, &bytes).unwrap();
        assert!(f.table.is_empty());
        assert_eq!(f.sync.stats().routes_ignored, 1);
    }

    #[test]
    fn test_delete_route() {
        let mut f = fixture();
        let add = route_builder(RTM_NEWROUTE, ip("10.1.0.0"), 16)
            .u32_attribute(RTA_OIF, 2)
            .build();
        let del = route_builder(RTM_DELROUTE, ip("10.1.0.0"), 16)
            .u32_attribute(RTA_OIF, 2)
            .build();
        apply(&mut f.sync, &add).unwrap();
        apply(&mut f.sync, &del).unwrap();

        assert!(f.table.is_empty());
        assert_eq!(f.sync.installed_count(), 0);
        assert!(matches!(&f.table.ops()[1], TableOp::Del { key } if key == "10.1.0.0/16"));
    }

    #[test]
    fn test_dump_reconciliation_withdraws_stale_routes() {
        let mut f = fixture();
        for prefix in ["10.1.0.0", "10.2.0.0"] {
            let bytes = route_builder(RTM_NEWROUTE, ip(prefix), 16)
                .u32_attribute(RTA_OIF, 2)
                .build();
            apply(&mut f.sync, &bytes).unwrap();
        }
        f.table.clear_ops();

        // Dump only refreshes 10.1.0.0/16.
        let refreshed = route_builder(RTM_NEWROUTE, ip("10.1.0.0"), 16)
            .flags(NLM_F_MULTIPART)
            .u32_attribute(RTA_OIF, 3)
            .build();
        apply(&mut f.sync, &refreshed).unwrap();
        assert!(f.sync.in_dump());
        assert_eq!(f.table.field(RESYNC_KEY, "nexthop").as_deref(), Some("0.0.0.0"));

        apply(&mut f.sync, &done()).unwrap();
        assert!(!f.sync.in_dump());

        assert_eq!(f.table.keys(), vec!["10.1.0.0/16".to_string()]);
        assert_eq!(
            f.table.ops(),
            vec![
                TableOp::Set {
                    key: RESYNC_KEY.to_string(),
                    fvs: fvs([("nexthop", "0.0.0.0")]),
                },
                TableOp::Set {
                    key: "10.1.0.0/16".to_string(),
                    fvs: fvs([("nexthop", "0.0.0.0"), ("ifname", "Ethernet4")]),
                },
                TableOp::Del {
                    key: "10.2.0.0/16".to_string(),
                },
                TableOp::Del {
                    key: RESYNC_KEY.to_string(),
                },
            ]
        );
        assert_eq!(f.sync.stats().stale_withdrawn, 1);
    }

    #[test]
    fn test_done_outside_dump_is_ignored() {
        let mut f = fixture();
        apply(&mut f.sync, &done()).unwrap();
        assert!(f.table.ops().is_empty());
    }

    #[test]
    fn test_dump_timeout_finishes_dump() {
        let table = MemoryProducerTable::new(APP_ROUTE_TABLE_NAME);
        let links = fixture().links;
        let config = RoutingConfig {
            dump_timeout_secs: 0,
            ..RoutingConfig::default()
        };
        let mut sync = RouteSync::new(Box::new(table.clone()), links, &config);

        let bytes = route_builder(RTM_NEWROUTE, ip("10.1.0.0"), 16)
            .flags(NLM_F_MULTIPART)
            .u32_attribute(RTA_OIF, 2)
            .build();
        apply(&mut sync, &bytes).unwrap();
        assert!(sync.in_dump());

        sync.on_timeout().unwrap();
        assert!(!sync.in_dump());
        assert_eq!(table.get(RESYNC_KEY), None);
        assert_eq!(sync.stats().dumps_completed, 1);
    }

    #[test]
    fn test_failed_stale_withdrawal_is_retried() {
        let (mut sync, table, fail_dels) = flaky_sync(&RoutingConfig::default());
        for prefix in ["10.1.0.0", "10.2.0.0", "10.3.0.0"] {
            let bytes = route_builder(RTM_NEWROUTE, ip(prefix), 16)
                .u32_attribute(RTA_OIF, 2)
                .build();
            apply(&mut sync, &bytes).unwrap();
        }
        let refreshed = route_builder(RTM_NEWROUTE, ip("10.9.0.0"), 16)
            .flags(NLM_F_MULTIPART)
            .u32_attribute(RTA_OIF, 2)
            .build();
        apply(&mut sync, &refreshed).unwrap();

        fail_dels.set(1);
        assert!(matches!(apply(&mut sync, &done()), Err(FpmError::Io(_))));
        assert!(sync.in_dump());
        assert_eq!(sync.stats().stale_withdrawn, 2);
        assert_eq!(sync.stats().dumps_completed, 0);
        // One stale route, the refreshed route and the marker remain.
        assert_eq!(table.len(), 3);
        assert!(table.get(RESYNC_KEY).is_some());

        apply(&mut sync, &done()).unwrap();
        assert!(!sync.in_dump());
        assert_eq!(table.keys(), vec!["10.9.0.0/16".to_string()]);
        assert_eq!(sync.installed_count(), 1);
        assert_eq!(sync.stats().stale_withdrawn, 3);
        assert_eq!(sync.stats().dumps_completed, 1);
    }

    #[test]
    fn test_failed_marker_delete_is_retried_on_timeout() {
        let config = RoutingConfig {
            dump_timeout_secs: 0,
            ..RoutingConfig::default()
        };
        let (mut sync, table, fail_dels) = flaky_sync(&config);
        let bytes = route_builder(RTM_NEWROUTE, ip("10.1.0.0"), 16)
            .flags(NLM_F_MULTIPART)
            .u32_attribute(RTA_OIF, 2)
            .build();
        apply(&mut sync, &bytes).unwrap();

        fail_dels.set(1);
        assert!(sync.on_timeout().is_err());
        assert!(sync.in_dump());
        assert!(table.get(RESYNC_KEY).is_some());

        sync.on_timeout().unwrap();
        assert!(!sync.in_dump());
        assert_eq!(table.get(RESYNC_KEY), None);
        assert_eq!(table.keys(), vec!["10.1.0.0/16".to_string()]);
    }

    #[test]
    fn test_malformed_multipath_rejected() {
        let mut f = fixture();
        let mut mp = multipath_value(&[(2, None)]);
        NativeEndian::write_u16(&mut mp[0..2], 64);
        let bytes = route_builder(RTM_NEWROUTE, ip("10.5.0.0"), 16)
            .attribute(RTA_MULTIPATH, &mp)
            .build();
        assert!(matches!(
            apply(&mut f.sync, &bytes).unwrap_err(),
            FpmError::InvalidAttribute { attribute: "RTA_MULTIPATH", .. }
        ));
    }
}
