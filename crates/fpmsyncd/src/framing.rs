//! FPM message framing
//!
//! The FPM peer writes a continuous TCP byte stream of messages, each
//! prefixed by a 4-byte big-endian header:
//!
//! ```text
//! 0        1        2                 4
//! +--------+--------+--------+--------+---------------------+
//! | version|  type  |  length (BE)    | payload             |
//! +--------+--------+--------+--------+---------------------+
//!                    length counts the header and the payload
//! ```
//!
//! [`FramingBuffer`] owns a fixed-size arena with a write cursor and a
//! consumed cursor. Reads land in the spare capacity after the write cursor;
//! [`FramingBuffer::drain`] hands out every complete message as a borrowed
//! [`RawMessage`] and then compacts the unconsumed tail to the front of the
//! arena. Headers are validated as soon as all four header bytes are visible,
//! so a bogus length is rejected before the buffer waits for it.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-5: Denial of Service Protection - Bounded reassembly memory
//! - SI-10: Information Input Validation - Header checks before buffering is trusted

use crate::error::{FpmError, FramingError, Result};
use byteorder::{BigEndian, ByteOrder};
use std::io;
use tracing::trace;

/// Only protocol version understood by this daemon.
pub const FPM_PROTO_VERSION: u8 = 1;

/// Size of the FPM message header.
pub const FPM_MSG_HDR_LEN: usize = 4;

/// Default upper bound on a single FPM message, header included.
pub const FPM_MAX_MSG_LEN: usize = 4096;

/// Largest length the 16-bit wire field can express.
pub const FPM_MAX_WIRE_LEN: usize = u16::MAX as usize;

/// Default number of maximum-size messages the arena can hold.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Logical message kinds multiplexed on the FPM transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FpmMessageType {
    /// Payload is a netlink message.
    Netlink = 1,
    /// Payload is a protobuf-encoded message; carried but not interpreted here.
    Protobuf = 2,
}

impl FpmMessageType {
    /// Map a wire value to a recognized message type.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Netlink),
            2 => Some(Self::Protobuf),
            _ => None,
        }
    }
}

/// Decoded FPM message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub msg_type: u8,
    /// Total message length, header included.
    pub length: u16,
}

impl MessageHeader {
    /// Build a header for a payload of `payload_len` bytes.
    pub fn new(
        msg_type: FpmMessageType,
        payload_len: usize,
    ) -> std::result::Result<Self, FramingError> {
        let total = FPM_MSG_HDR_LEN + payload_len;
        if total > FPM_MAX_WIRE_LEN {
            return Err(FramingError::LengthTooLong {
                length: total,
                max: FPM_MAX_WIRE_LEN,
            });
        }
        Ok(Self {
            version: FPM_PROTO_VERSION,
            msg_type: msg_type as u8,
            length: total as u16,
        })
    }

    /// Parse a header from the front of `bytes`; `None` if fewer than
    /// [`FPM_MSG_HDR_LEN`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FPM_MSG_HDR_LEN {
            return None;
        }
        Some(Self {
            version: bytes[0],
            msg_type: bytes[1],
            length: BigEndian::read_u16(&bytes[2..4]),
        })
    }

    /// Serialize into the first [`FPM_MSG_HDR_LEN`] bytes of `dst`.
    pub fn write(&self, dst: &mut [u8]) {
        dst[0] = self.version;
        dst[1] = self.msg_type;
        BigEndian::write_u16(&mut dst[2..4], self.length);
    }

    /// Declared total length in bytes.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.length as usize
    }

    pub fn message_type(&self) -> Option<FpmMessageType> {
        FpmMessageType::from_wire(self.msg_type)
    }
}

/// Encode one FPM message.
pub fn encode_message(
    msg_type: FpmMessageType,
    payload: &[u8],
) -> std::result::Result<Vec<u8>, FramingError> {
    let header = MessageHeader::new(msg_type, payload.len())?;
    let mut out = vec![0u8; FPM_MSG_HDR_LEN];
    header.write(&mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Whether a validated header's full message is already buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Incomplete,
}

/// Checks FPM headers against protocol limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageValidator {
    max_message_len: usize,
}

impl MessageValidator {
    /// `max_message_len` is clamped to what the 16-bit length field can carry.
    pub fn new(max_message_len: usize) -> Self {
        Self {
            max_message_len: max_message_len.clamp(FPM_MSG_HDR_LEN, FPM_MAX_WIRE_LEN),
        }
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Validate `header` given `available` buffered bytes starting at the
    /// header.
    ///
    /// Errors mean the stream is corrupt and the connection must be dropped.
    pub fn validate(
        &self,
        header: &MessageHeader,
        available: usize,
    ) -> std::result::Result<Completeness, FramingError> {
        if header.version != FPM_PROTO_VERSION {
            return Err(FramingError::UnsupportedVersion(header.version));
        }
        if header.message_type().is_none() {
            return Err(FramingError::UnknownMessageType(header.msg_type));
        }
        let length = header.total_len();
        if length < FPM_MSG_HDR_LEN {
            return Err(FramingError::LengthTooShort {
                length,
                min: FPM_MSG_HDR_LEN,
            });
        }
        if length > self.max_message_len {
            return Err(FramingError::LengthTooLong {
                length,
                max: self.max_message_len,
            });
        }
        if available < length {
            Ok(Completeness::Incomplete)
        } else {
            Ok(Completeness::Complete)
        }
    }
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self::new(FPM_MAX_MSG_LEN)
    }
}

/// One complete, validated FPM message borrowed from the reassembly arena.
///
/// Only obtainable inside a [`FramingBuffer::drain`] callback, so it can
/// never outlive the compaction that follows.
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a> {
    header: MessageHeader,
    msg_type: FpmMessageType,
    bytes: &'a [u8],
}

impl<'a> RawMessage<'a> {
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn message_type(&self) -> FpmMessageType {
        self.msg_type
    }

    /// Bytes after the FPM header.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[FPM_MSG_HDR_LEN..]
    }

    /// Whole message, header included.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Reassembly arena for one FPM connection.
pub struct FramingBuffer {
    buf: Vec<u8>,
    write_pos: usize,
    consumed_pos: usize,
    validator: MessageValidator,
}

impl std::fmt::Debug for FramingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramingBuffer")
            .field("capacity", &self.buf.len())
            .field("write_pos", &self.write_pos)
            .field("consumed_pos", &self.consumed_pos)
            .field("validator", &self.validator)
            .finish()
    }
}

impl FramingBuffer {
    /// Allocate an arena able to hold `batch_size` maximum-size messages.
    pub fn new(validator: MessageValidator, batch_size: usize) -> Self {
        let capacity = validator.max_message_len() * batch_size.max(1);
        Self {
            buf: vec![0u8; capacity],
            write_pos: 0,
            consumed_pos: 0,
            validator,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes received but not yet handed out as messages.
    pub fn pending(&self) -> usize {
        self.write_pos - self.consumed_pos
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn spare_capacity(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    pub fn validator(&self) -> &MessageValidator {
        &self.validator
    }

    /// Perform one bounded read into the spare capacity.
    ///
    /// `read` receives the writable tail of the arena and reports how many
    /// bytes it filled. Returns `Ok(Some(n))` for `n` new bytes, `Ok(None)`
    /// if the source had nothing ready, and [`FpmError::ConnectionClosed`] on
    /// end of stream.
    pub fn fill_with<F>(&mut self, read: F) -> Result<Option<usize>>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        if self.spare_capacity() == 0 {
            return Err(FramingError::BufferExhausted {
                pending: self.pending(),
                capacity: self.capacity(),
            }
            .into());
        }

        match read(&mut self.buf[self.write_pos..]) {
            Ok(0) => Err(FpmError::ConnectionClosed),
            Ok(n) => {
                self.write_pos += n;
                trace!(bytes = n, pending = self.pending(), "Buffered FPM bytes");
                Ok(Some(n))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(FpmError::Io(e)),
        }
    }

    /// Append bytes that were read elsewhere.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.spare_capacity() {
            return Err(FramingError::BufferExhausted {
                pending: self.pending() + bytes.len(),
                capacity: self.capacity(),
            }
            .into());
        }
        let end = self.write_pos + bytes.len();
        self.buf[self.write_pos..end].copy_from_slice(bytes);
        self.write_pos = end;
        Ok(())
    }

    /// Hand every complete message to `f` in arrival order, then compact.
    ///
    /// Stops at the first framing error or the first error returned by `f`;
    /// both are propagated. Returns the number of messages handed out.
    pub fn drain<F>(&mut self, mut f: F) -> Result<usize>
    where
        F: FnMut(RawMessage<'_>) -> Result<()>,
    {
        let validator = self.validator;
        let write_pos = self.write_pos;
        let mut consumed = self.consumed_pos;
        let mut count = 0usize;

        let outcome = {
            let buf = &self.buf;
            loop {
                let window = &buf[consumed..write_pos];
                let Some(header) = MessageHeader::parse(window) else {
                    break Ok(());
                };
                match validator.validate(&header, window.len()) {
                    Err(e) => break Err(FpmError::from(e)),
                    Ok(Completeness::Incomplete) => break Ok(()),
                    Ok(Completeness::Complete) => {}
                }
                let Some(msg_type) = header.message_type() else {
                    break Err(FramingError::UnknownMessageType(header.msg_type).into());
                };

                let end = consumed + header.total_len();
                let message = RawMessage {
                    header,
                    msg_type,
                    bytes: &buf[consumed..end],
                };
                consumed = end;
                count += 1;

                if let Err(e) = f(message) {
                    break Err(e);
                }
            }
        };

        self.consumed_pos = consumed;
        self.compact();
        outcome.map(|()| count)
    }

    /// Append `bytes` and drain every message that became complete.
    pub fn feed<F>(&mut self, bytes: &[u8], f: F) -> Result<usize>
    where
        F: FnMut(RawMessage<'_>) -> Result<()>,
    {
        self.extend(bytes)?;
        self.drain(f)
    }

    /// Drop all buffered state.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.consumed_pos = 0;
    }

    fn compact(&mut self) {
        if self.consumed_pos == 0 {
            return;
        }
        self.buf.copy_within(self.consumed_pos..self.write_pos, 0);
        self.write_pos -= self.consumed_pos;
        self.consumed_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netlink_frame(payload: &[u8]) -> Vec<u8> {
        encode_message(FpmMessageType::Netlink, payload).unwrap()
    }

    fn collect(buffer: &mut FramingBuffer, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        buffer.feed(bytes, |msg| {
            out.push(msg.payload().to_vec());
            Ok(())
        })?;
        Ok(out)
    }

    fn small_buffer() -> FramingBuffer {
        FramingBuffer::new(MessageValidator::new(64), 4)
    }

    #[test]
    fn test_header_parse_and_write() {
        let header = MessageHeader::new(FpmMessageType::Netlink, 36).unwrap();
        let mut bytes = [0u8; 4];
        header.write(&mut bytes);
        assert_eq!(bytes, [1, 1, 0, 40]);
        assert_eq!(MessageHeader::parse(&bytes), Some(header));
        assert_eq!(MessageHeader::parse(&bytes[..3]), None);
    }

    #[test]
    fn test_header_rejects_oversized_payload() {
        let err = MessageHeader::new(FpmMessageType::Netlink, FPM_MAX_WIRE_LEN).unwrap_err();
        assert!(matches!(err, FramingError::LengthTooLong { .. }));
    }

    #[test]
    fn test_validator_checks() {
        let validator = MessageValidator::new(128);
        let ok = MessageHeader {
            version: 1,
            msg_type: 1,
            length: 20,
        };
        assert_eq!(validator.validate(&ok, 20), Ok(Completeness::Complete));
        assert_eq!(validator.validate(&ok, 19), Ok(Completeness::Incomplete));

        let bad_version = MessageHeader { version: 2, ..ok };
        assert_eq!(
            validator.validate(&bad_version, 20),
            Err(FramingError::UnsupportedVersion(2))
        );

        let bad_type = MessageHeader { msg_type: 0, ..ok };
        assert_eq!(
            validator.validate(&bad_type, 20),
            Err(FramingError::UnknownMessageType(0))
        );

        let too_short = MessageHeader { length: 3, ..ok };
        assert!(matches!(
            validator.validate(&too_short, 20),
            Err(FramingError::LengthTooShort { length: 3, .. })
        ));

        let too_long = MessageHeader { length: 129, ..ok };
        assert!(matches!(
            validator.validate(&too_long, 4),
            Err(FramingError::LengthTooLong { length: 129, max: 128 })
        ));
    }

    #[test]
    fn test_protobuf_type_is_recognized() {
        let validator = MessageValidator::default();
        let header = MessageHeader {
            version: 1,
            msg_type: 2,
            length: 4,
        };
        assert_eq!(validator.validate(&header, 4), Ok(Completeness::Complete));
    }

    #[test]
    fn test_header_only_message() {
        let mut buffer = small_buffer();
        let frames = collect(&mut buffer, &netlink_frame(&[])).unwrap();
        assert_eq!(frames, vec![Vec::<u8>::new()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_messages_in_one_feed() {
        let mut buffer = small_buffer();
        let mut stream = netlink_frame(b"first");
        stream.extend(netlink_frame(b"second"));
        stream.extend(netlink_frame(b"third"));

        let frames = collect(&mut buffer, &stream).unwrap();
        assert_eq!(
            frames,
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_message_is_kept_across_feeds() {
        let mut buffer = small_buffer();
        let frame = netlink_frame(b"payload");

        assert!(collect(&mut buffer, &frame[..2]).unwrap().is_empty());
        assert_eq!(buffer.pending(), 2);
        assert!(collect(&mut buffer, &frame[2..6]).unwrap().is_empty());
        assert_eq!(buffer.pending(), 6);

        let frames = collect(&mut buffer, &frame[6..]).unwrap();
        assert_eq!(frames, vec![b"payload".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_every_split_point_yields_same_messages() {
        let mut stream = netlink_frame(b"alpha");
        stream.extend(netlink_frame(b"bravo-charlie"));
        stream.extend(netlink_frame(b""));

        let mut whole = small_buffer();
        let expected = collect(&mut whole, &stream).unwrap();
        assert_eq!(expected.len(), 3);

        for a in 0..=stream.len() {
            for b in a..=stream.len() {
                let mut buffer = small_buffer();
                let mut got = Vec::new();
                for chunk in [&stream[..a], &stream[a..b], &stream[b..]] {
                    got.extend(collect(&mut buffer, chunk).unwrap());
                }
                assert_eq!(got, expected, "split at {a}/{b}");
                assert!(buffer.is_empty());
            }
        }
    }

    #[test]
    fn test_oversized_length_rejected_before_payload_arrives() {
        let mut buffer = small_buffer();
        // Only the header: declared length 65 > max 64.
        let err = collect(&mut buffer, &[1, 1, 0, 65]).unwrap_err();
        assert!(matches!(
            err,
            FpmError::Framing(FramingError::LengthTooLong { length: 65, max: 64 })
        ));
    }

    #[test]
    fn test_length_below_header_rejected() {
        let mut buffer = small_buffer();
        let err = collect(&mut buffer, &[1, 1, 0, 2, 0xaa, 0xbb]).unwrap_err();
        assert!(matches!(
            err,
            FpmError::Framing(FramingError::LengthTooShort { length: 2, .. })
        ));
    }

    #[test]
    fn test_messages_before_corruption_are_delivered() {
        let mut buffer = small_buffer();
        let mut stream = netlink_frame(b"good");
        stream.extend([9, 1, 0, 8, 0, 0, 0, 0]);

        let mut seen = Vec::new();
        let err = buffer
            .feed(&stream, |msg| {
                seen.push(msg.payload().to_vec());
                Ok(())
            })
            .unwrap_err();
        assert_eq!(seen, vec![b"good".to_vec()]);
        assert!(matches!(
            err,
            FpmError::Framing(FramingError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_callback_error_stops_drain() {
        let mut buffer = small_buffer();
        let mut stream = netlink_frame(b"one");
        stream.extend(netlink_frame(b"two"));

        let mut calls = 0;
        let err = buffer
            .feed(&stream, |_| {
                calls += 1;
                Err(FpmError::Internal("stop".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, FpmError::Internal(_)));
        // The untouched second message stays buffered.
        assert_eq!(buffer.pending(), 7);
    }

    #[test]
    fn test_memory_stays_bounded() {
        let mut buffer = FramingBuffer::new(MessageValidator::new(64), 2);
        let capacity = buffer.capacity();
        let frame = netlink_frame(&[0x5a; 50]);
        let mut stream = Vec::new();
        for _ in 0..200 {
            stream.extend_from_slice(&frame);
        }

        let mut delivered = 0;
        for chunk in stream.chunks(37) {
            delivered += buffer
                .feed(chunk, |msg| {
                    assert_eq!(msg.len(), 54);
                    Ok(())
                })
                .unwrap();
            assert!(buffer.pending() < 64);
            assert_eq!(buffer.capacity(), capacity);
        }
        assert_eq!(delivered, 200);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fill_with_reads_into_spare_capacity() {
        let mut buffer = small_buffer();
        let frame = netlink_frame(b"xyz");
        let n = buffer
            .fill_with(|spare| {
                spare[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            })
            .unwrap();
        assert_eq!(n, Some(frame.len()));

        let mut seen = 0;
        buffer
            .drain(|msg| {
                assert_eq!(msg.payload(), b"xyz");
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_fill_with_zero_read_is_connection_closed() {
        let mut buffer = small_buffer();
        let err = buffer.fill_with(|_| Ok(0)).unwrap_err();
        assert!(matches!(err, FpmError::ConnectionClosed));
    }

    #[test]
    fn test_fill_with_would_block_is_not_an_error() {
        let mut buffer = small_buffer();
        let got = buffer
            .fill_with(|_| Err(io::Error::from(io::ErrorKind::WouldBlock)))
            .unwrap();
        assert_eq!(got, None);

        let err = buffer
            .fill_with(|_| Err(io::Error::from(io::ErrorKind::ConnectionReset)))
            .unwrap_err();
        assert!(matches!(err, FpmError::Io(_)));
    }

    #[test]
    fn test_extend_beyond_capacity_fails() {
        let mut buffer = FramingBuffer::new(MessageValidator::new(16), 1);
        let err = buffer.extend(&[0u8; 17]).unwrap_err();
        assert!(matches!(
            err,
            FpmError::Framing(FramingError::BufferExhausted { capacity: 16, .. })
        ));
    }

    #[test]
    fn test_clear_discards_partial_state() {
        let mut buffer = small_buffer();
        collect(&mut buffer, &netlink_frame(b"abc")[..5]).unwrap();
        assert_eq!(buffer.pending(), 5);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.spare_capacity(), buffer.capacity());
    }
}
