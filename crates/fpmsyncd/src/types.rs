//! Core types for route, link and neighbor synchronization
//!
//! Fixed family headers of rtnetlink messages (`rtmsg`, `ifinfomsg`,
//! `ndmsg`) and the small value types carried in their attributes.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Interface and neighbor identification
//! - SI-10: Information Input Validation - Fixed headers are length-checked

use byteorder::{ByteOrder, NativeEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

/// Main routing table id
pub const RT_TABLE_MAIN: u32 = 254;

/// MAC address representation
///
/// # NIST Controls
/// - IA-3: Device Identification - MAC addresses for device identification
/// - AU-3: Content of Audit Records - MAC included in neighbor audit records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const ZERO: Self = Self([0, 0, 0, 0, 0, 0]);

    pub const BROADCAST: Self = Self([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    /// From a 6-byte link-layer address attribute
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parse MAC from colon-separated string (e.g., "00:11:22:33:44:55")
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Kernel neighbor state (NUD_* values from linux/neighbour.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum NeighborState {
    Incomplete = 0x01,
    Reachable = 0x02,
    Stale = 0x04,
    Delay = 0x08,
    Probe = 0x10,
    Failed = 0x20,
    NoArp = 0x40,
    Permanent = 0x80,
    Unknown = 0x00,
}

impl NeighborState {
    /// Create from kernel NUD_* value
    pub fn from_kernel(state: u16) -> Self {
        match state {
            0x01 => Self::Incomplete,
            0x02 => Self::Reachable,
            0x04 => Self::Stale,
            0x08 => Self::Delay,
            0x10 => Self::Probe,
            0x20 => Self::Failed,
            0x40 => Self::NoArp,
            0x80 => Self::Permanent,
            _ => Self::Unknown,
        }
    }

    /// Check if this state indicates the neighbor is resolvable
    #[inline]
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            Self::Reachable | Self::Stale | Self::Delay | Self::Probe | Self::Permanent
        )
    }
}

/// Address family name as written to APPL_DB
pub fn family_str(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IPv4",
        IpAddr::V6(_) => "IPv6",
    }
}

/// Unspecified address of the given family, used for connected next hops
pub fn unspecified_for(family: u8) -> IpAddr {
    if family == AF_INET6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Route type (RTN_* values from linux/rtnetlink.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    Unicast,
    Blackhole,
    Unreachable,
    Prohibit,
    Other(u8),
}

impl RouteType {
    pub fn from_kernel(value: u8) -> Self {
        match value {
            1 => Self::Unicast,
            6 => Self::Blackhole,
            7 => Self::Unreachable,
            8 => Self::Prohibit,
            v => Self::Other(v),
        }
    }

    pub fn to_kernel(self) -> u8 {
        match self {
            Self::Unicast => 1,
            Self::Blackhole => 6,
            Self::Unreachable => 7,
            Self::Prohibit => 8,
            Self::Other(v) => v,
        }
    }

    /// Route drops traffic instead of forwarding it
    pub fn is_drop(self) -> bool {
        matches!(self, Self::Blackhole | Self::Unreachable | Self::Prohibit)
    }
}

/// `struct rtmsg`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteHeader {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub route_type: RouteType,
    pub flags: u32,
}

impl RouteHeader {
    pub const LEN: usize = 12;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(Self {
            family: bytes[0],
            dst_len: bytes[1],
            src_len: bytes[2],
            tos: bytes[3],
            table: bytes[4],
            protocol: bytes[5],
            scope: bytes[6],
            route_type: RouteType::from_kernel(bytes[7]),
            flags: NativeEndian::read_u32(&bytes[8..12]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.family;
        out[1] = self.dst_len;
        out[2] = self.src_len;
        out[3] = self.tos;
        out[4] = self.table;
        out[5] = self.protocol;
        out[6] = self.scope;
        out[7] = self.route_type.to_kernel();
        NativeEndian::write_u32(&mut out[8..12], self.flags);
        out
    }

    /// Unicast route in the main table
    pub fn unicast(family: u8, dst_len: u8) -> Self {
        Self {
            family,
            dst_len,
            src_len: 0,
            tos: 0,
            table: RT_TABLE_MAIN as u8,
            protocol: 0,
            scope: 0,
            route_type: RouteType::Unicast,
            flags: 0,
        }
    }
}

/// `struct ifinfomsg`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeader {
    pub family: u8,
    pub link_type: u16,
    pub index: u32,
    pub flags: u32,
    pub change: u32,
}

impl LinkHeader {
    pub const LEN: usize = 16;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(Self {
            family: bytes[0],
            link_type: NativeEndian::read_u16(&bytes[2..4]),
            index: NativeEndian::read_u32(&bytes[4..8]),
            flags: NativeEndian::read_u32(&bytes[8..12]),
            change: NativeEndian::read_u32(&bytes[12..16]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.family;
        NativeEndian::write_u16(&mut out[2..4], self.link_type);
        NativeEndian::write_u32(&mut out[4..8], self.index);
        NativeEndian::write_u32(&mut out[8..12], self.flags);
        NativeEndian::write_u32(&mut out[12..16], self.change);
        out
    }

    pub fn with_index(index: u32) -> Self {
        Self {
            family: 0,
            link_type: 0,
            index,
            flags: 0,
            change: 0,
        }
    }
}

/// `struct ndmsg`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborHeader {
    pub family: u8,
    pub ifindex: u32,
    pub state: NeighborState,
    pub flags: u8,
    pub neigh_type: u8,
}

impl NeighborHeader {
    pub const LEN: usize = 12;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(Self {
            family: bytes[0],
            ifindex: NativeEndian::read_u32(&bytes[4..8]),
            state: NeighborState::from_kernel(NativeEndian::read_u16(&bytes[8..10])),
            flags: bytes[10],
            neigh_type: bytes[11],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.family;
        NativeEndian::write_u32(&mut out[4..8], self.ifindex);
        NativeEndian::write_u16(&mut out[8..10], self.state as u16);
        out[10] = self.flags;
        out[11] = self.neigh_type;
        out
    }
}
