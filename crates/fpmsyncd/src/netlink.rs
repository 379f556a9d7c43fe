//! Netlink payload decoding for FPM messages
//!
//! An FPM message of type NETLINK carries exactly one netlink message:
//! a 16-byte native-endian header, a fixed family header whose size depends
//! on the message type, and a stream of 4-byte aligned TLV attributes.
//!
//! Decoding borrows from the FPM payload; a [`DecodedNetlinkObject`] lives
//! only as long as the dispatch of the message it came from.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Bounds checks on every length field
//! - SC-7: Boundary Protection - Peer data is untrusted

use crate::error::DecodeError;
use byteorder::{ByteOrder, NativeEndian};
use netlink_packet_core::{
    NetlinkBuffer, NLA_ALIGNTO, NLA_F_NESTED, NLA_HEADER_SIZE, NLA_TYPE_MASK, NLMSG_DONE,
    NLM_F_MULTIPART,
};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::trace;

/// Size of the netlink message header.
pub const NETLINK_HEADER_LEN: usize = 16;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_NEWNEIGH: u16 = 28;
pub const RTM_DELNEIGH: u16 = 29;
pub const RTM_NEWNEXTHOP: u16 = 104;
pub const RTM_DELNEXTHOP: u16 = 105;

/// Family header sizes (struct ifinfomsg, ifaddrmsg, rtmsg, ndmsg, nhmsg).
const IFINFOMSG_LEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;
const RTMSG_LEN: usize = 12;
const NDMSG_LEN: usize = 12;
const NHMSG_LEN: usize = 8;

/// Netlink message families this daemon knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Link,
    Address,
    Route,
    Neighbor,
    NextHop,
    /// End of a multipart dump.
    Done,
}

impl MessageKind {
    /// All kinds, in registry order.
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Link,
        MessageKind::Address,
        MessageKind::Route,
        MessageKind::Neighbor,
        MessageKind::NextHop,
        MessageKind::Done,
    ];

    pub fn from_message_type(message_type: u16) -> Option<Self> {
        match message_type {
            RTM_NEWLINK | RTM_DELLINK => Some(Self::Link),
            RTM_NEWADDR | RTM_DELADDR => Some(Self::Address),
            RTM_NEWROUTE | RTM_DELROUTE => Some(Self::Route),
            RTM_NEWNEIGH | RTM_DELNEIGH => Some(Self::Neighbor),
            RTM_NEWNEXTHOP | RTM_DELNEXTHOP => Some(Self::NextHop),
            NLMSG_DONE => Some(Self::Done),
            _ => None,
        }
    }

    /// Length of the fixed family header that precedes the attributes.
    pub fn family_header_len(self) -> usize {
        match self {
            Self::Link => IFINFOMSG_LEN,
            Self::Address => IFADDRMSG_LEN,
            Self::Route => RTMSG_LEN,
            Self::Neighbor => NDMSG_LEN,
            Self::NextHop => NHMSG_LEN,
            Self::Done => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Address => "address",
            Self::Route => "route",
            Self::Neighbor => "neighbor",
            Self::NextHop => "nexthop",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of the netlink message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetlinkHeader {
    pub length: u32,
    pub message_type: u16,
    pub flags: u16,
    pub sequence: u32,
    pub port: u32,
}

/// One netlink attribute borrowed from the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute<'a> {
    kind: u16,
    nested: bool,
    value: &'a [u8],
}

impl<'a> Attribute<'a> {
    /// Attribute type with the flag bits masked off.
    pub fn kind(&self) -> u16 {
        self.kind
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self.value {
            [b] => Some(*b),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        (self.value.len() == 2).then(|| NativeEndian::read_u16(self.value))
    }

    pub fn as_u32(&self) -> Option<u32> {
        (self.value.len() == 4).then(|| NativeEndian::read_u32(self.value))
    }

    /// String value, trailing NUL bytes stripped.
    pub fn as_str(&self) -> Option<&'a str> {
        let end = self
            .value
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.value.len());
        std::str::from_utf8(&self.value[..end]).ok()
    }

    /// IPv4 (4 bytes) or IPv6 (16 bytes) address value.
    pub fn as_ip(&self) -> Option<IpAddr> {
        match self.value.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(self.value);
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.value);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    /// Parse the value as a stream of nested attributes.
    pub fn nested(&self) -> Result<Vec<Attribute<'a>>, DecodeError> {
        parse_attributes(self.value)
    }
}

/// Iterator over a TLV attribute stream.
///
/// Yields an error at most once and then stops.
#[derive(Debug, Clone)]
pub struct AttributeIter<'a> {
    buf: &'a [u8],
    offset: usize,
    base: usize,
}

impl<'a> AttributeIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_base(buf, 0)
    }

    /// `base` is added to offsets reported in errors.
    pub fn with_base(buf: &'a [u8], base: usize) -> Self {
        Self {
            buf,
            offset: 0,
            base,
        }
    }
}

impl<'a> Iterator for AttributeIter<'a> {
    type Item = Result<Attribute<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.buf.len() - self.offset;
        if remaining < NLA_HEADER_SIZE {
            // Trailing bytes shorter than an attribute header are padding.
            return None;
        }

        let at = self.offset;
        let length = NativeEndian::read_u16(&self.buf[at..at + 2]) as usize;
        let raw_kind = NativeEndian::read_u16(&self.buf[at + 2..at + 4]);

        if length < NLA_HEADER_SIZE {
            self.offset = self.buf.len();
            return Some(Err(DecodeError::AttributeTooShort {
                offset: self.base + at,
                length,
            }));
        }
        if length > remaining {
            self.offset = self.buf.len();
            return Some(Err(DecodeError::AttributeOverrun {
                offset: self.base + at,
                length,
                remaining,
            }));
        }

        let attribute = Attribute {
            kind: raw_kind & NLA_TYPE_MASK,
            nested: raw_kind & NLA_F_NESTED != 0,
            value: &self.buf[at + NLA_HEADER_SIZE..at + length],
        };
        self.offset = (at + align(length)).min(self.buf.len());
        Some(Ok(attribute))
    }
}

/// Collect an attribute stream, failing on the first malformed attribute.
pub fn parse_attributes(buf: &[u8]) -> Result<Vec<Attribute<'_>>, DecodeError> {
    AttributeIter::new(buf).collect()
}

#[inline]
fn align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// A decoded netlink message.
#[derive(Debug, Clone)]
pub struct DecodedNetlinkObject<'a> {
    pub header: NetlinkHeader,
    /// `None` for message types this daemon does not classify.
    pub kind: Option<MessageKind>,
    /// Address family (first byte of the family header), 0 if absent.
    pub family: u8,
    pub family_header: &'a [u8],
    pub attributes: Vec<Attribute<'a>>,
    /// Everything after the netlink header.
    pub body: &'a [u8],
}

impl<'a> DecodedNetlinkObject<'a> {
    pub fn message_type(&self) -> u16 {
        self.header.message_type
    }

    /// First attribute of the given type.
    pub fn attribute(&self, kind: u16) -> Option<&Attribute<'a>> {
        self.attributes.iter().find(|a| a.kind == kind)
    }

    /// True for messages that are part of a multipart dump.
    pub fn is_dump_part(&self) -> bool {
        self.header.flags & NLM_F_MULTIPART != 0
    }

    /// True for the message terminating a multipart dump.
    pub fn is_dump_done(&self) -> bool {
        self.header.message_type == NLMSG_DONE
    }
}

/// Converts NETLINK-type FPM payloads into [`DecodedNetlinkObject`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkDecoder;

impl NetlinkDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode one netlink message occupying all of `payload`.
    pub fn decode<'a>(&self, payload: &'a [u8]) -> Result<DecodedNetlinkObject<'a>, DecodeError> {
        if payload.len() < NETLINK_HEADER_LEN {
            return Err(DecodeError::Truncated {
                len: payload.len(),
                needed: NETLINK_HEADER_LEN,
            });
        }

        let buffer = NetlinkBuffer::new(payload);
        let header = NetlinkHeader {
            length: buffer.length(),
            message_type: buffer.message_type(),
            flags: buffer.flags(),
            sequence: buffer.sequence_number(),
            port: buffer.port_number(),
        };

        if header.length as usize != payload.len() {
            return Err(DecodeError::LengthMismatch {
                inner: header.length as usize,
                outer: payload.len(),
            });
        }

        let body = &payload[NETLINK_HEADER_LEN..];
        let kind = MessageKind::from_message_type(header.message_type);

        let (family_header, attributes) = match kind {
            Some(MessageKind::Done) | None => (&body[..0], Vec::new()),
            Some(kind) => {
                let needed = kind.family_header_len();
                if body.len() < needed {
                    return Err(DecodeError::ShortFamilyHeader {
                        message_type: header.message_type,
                        len: body.len(),
                        needed,
                    });
                }
                let attrs = AttributeIter::with_base(&body[needed..], NETLINK_HEADER_LEN + needed)
                    .collect::<Result<Vec<_>, _>>()?;
                (&body[..needed], attrs)
            }
        };

        trace!(
            message_type = header.message_type,
            seq = header.sequence,
            attributes = attributes.len(),
            "Decoded netlink message"
        );

        Ok(DecodedNetlinkObject {
            header,
            kind,
            family: family_header.first().copied().unwrap_or(0),
            family_header,
            attributes,
            body,
        })
    }
}

/// Builds netlink messages in wire format.
///
/// Used by the resync tooling and by tests that play the FPM peer.
#[derive(Debug, Clone)]
pub struct NetlinkMessageBuilder {
    message_type: u16,
    flags: u16,
    sequence: u32,
    port: u32,
    family_header: Vec<u8>,
    attributes: Vec<u8>,
}

impl NetlinkMessageBuilder {
    pub fn new(message_type: u16) -> Self {
        Self {
            message_type,
            flags: 0,
            sequence: 0,
            port: 0,
            family_header: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    pub fn family_header(mut self, bytes: &[u8]) -> Self {
        self.family_header = bytes.to_vec();
        self
    }

    pub fn attribute(mut self, kind: u16, value: &[u8]) -> Self {
        emit_attribute(&mut self.attributes, kind, value);
        self
    }

    pub fn u32_attribute(self, kind: u16, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        NativeEndian::write_u32(&mut bytes, value);
        self.attribute(kind, &bytes)
    }

    /// NUL-terminated string attribute.
    pub fn str_attribute(self, kind: u16, value: &str) -> Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.attribute(kind, &bytes)
    }

    pub fn ip_attribute(self, kind: u16, value: IpAddr) -> Self {
        match value {
            IpAddr::V4(v4) => self.attribute(kind, &v4.octets()),
            IpAddr::V6(v6) => self.attribute(kind, &v6.octets()),
        }
    }

    /// Attribute whose value is an already-encoded attribute stream.
    pub fn nested_attribute(mut self, kind: u16, inner: &[u8]) -> Self {
        emit_attribute(&mut self.attributes, kind | NLA_F_NESTED, inner);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let length = NETLINK_HEADER_LEN + self.family_header.len() + self.attributes.len();
        let mut out = vec![0u8; NETLINK_HEADER_LEN];
        NativeEndian::write_u32(&mut out[0..4], length as u32);
        NativeEndian::write_u16(&mut out[4..6], self.message_type);
        NativeEndian::write_u16(&mut out[6..8], self.flags);
        NativeEndian::write_u32(&mut out[8..12], self.sequence);
        NativeEndian::write_u32(&mut out[12..16], self.port);
        out.extend_from_slice(&self.family_header);
        out.extend_from_slice(&self.attributes);
        out
    }
}

/// Append one attribute, padded to the attribute alignment, to `out`.
pub fn emit_attribute(out: &mut Vec<u8>, kind: u16, value: &[u8]) {
    let length = NLA_HEADER_SIZE + value.len();
    let mut header = [0u8; NLA_HEADER_SIZE];
    NativeEndian::write_u16(&mut header[0..2], length as u16);
    NativeEndian::write_u16(&mut header[2..4], kind);
    out.extend_from_slice(&header);
    out.extend_from_slice(value);
    out.resize(out.len() + align(length) - length, 0);
}
