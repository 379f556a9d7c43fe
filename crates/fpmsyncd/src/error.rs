//! Error types for fpmsyncd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Framing and decode errors reject malformed peer input
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors include sufficient detail for audit

use thiserror::Error;

/// Errors raised while delimiting FPM messages in the byte stream.
///
/// Every framing error is fatal to the connection: once a length field is
/// untrustworthy there is no safe offset to resume from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("unsupported FPM protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unrecognized FPM message type {0}")]
    UnknownMessageType(u8),

    #[error("declared FPM message length {length} is below the header size {min}")]
    LengthTooShort { length: usize, min: usize },

    #[error("declared FPM message length {length} exceeds the maximum {max}")]
    LengthTooLong { length: usize, max: usize },

    #[error("reassembly buffer exhausted ({pending} bytes pending, capacity {capacity})")]
    BufferExhausted { pending: usize, capacity: usize },
}

/// Errors raised while decoding the netlink payload of an FPM message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload cannot hold a netlink header.
    #[error("netlink payload truncated: {len} bytes, header needs {needed}")]
    Truncated { len: usize, needed: usize },

    /// Inner netlink length disagrees with the enclosing FPM payload.
    #[error("netlink length {inner} does not match FPM payload length {outer}")]
    LengthMismatch { inner: usize, outer: usize },

    #[error("netlink message type {message_type} body ({len} bytes) shorter than its {needed}-byte family header")]
    ShortFamilyHeader {
        message_type: u16,
        len: usize,
        needed: usize,
    },

    #[error("attribute at offset {offset} declares length {length} below the attribute header size")]
    AttributeTooShort { offset: usize, length: usize },

    #[error("attribute at offset {offset} declares length {length} but only {remaining} bytes remain")]
    AttributeOverrun {
        offset: usize,
        length: usize,
        remaining: usize,
    },
}

impl DecodeError {
    /// True when the error means the outer framing contract itself was
    /// violated, so subsequent byte offsets cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::Truncated { .. } | DecodeError::LengthMismatch { .. }
        )
    }
}

/// Errors that can occur in fpmsyncd
///
/// # NIST Controls
/// - SI-11(a): Generate error messages providing information necessary for corrective actions
/// - SI-11(b): Reveal only information necessary for error handling (no sensitive data exposure)
#[derive(Debug, Error)]
pub enum FpmError {
    /// Socket operation failed
    /// NIST: SC-7 (Boundary Protection) - Transport errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The FPM peer closed its end of the connection
    #[error("FPM connection closed by peer")]
    ConnectionClosed,

    /// Byte stream could not be delimited into messages
    /// NIST: SI-10 (Information Input Validation)
    #[error("Malformed FPM message: {0}")]
    Framing(#[from] FramingError),

    /// Netlink payload could not be decoded
    /// NIST: SI-10 (Information Input Validation)
    #[error("Netlink decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A handler needed an attribute the message did not carry
    #[error("Missing required attribute {attribute} in {context}")]
    MissingAttribute {
        attribute: &'static str,
        context: &'static str,
    },

    /// An attribute was present but its value is unusable
    #[error("Invalid attribute {attribute}: {reason}")]
    InvalidAttribute {
        attribute: &'static str,
        reason: String,
    },

    /// Interface lookup failed
    /// NIST: CM-8 (System Component Inventory) - Interface tracking
    #[error("Interface not found: index {0}")]
    UnknownInterface(u32),

    /// Redis connection or operation failed
    /// NIST: SC-8 (Transmission Confidentiality) - Database communication errors
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FpmError {
    /// Returns true if this error must tear down the current FPM connection.
    ///
    /// Handler level failures (missing attributes, unknown interfaces,
    /// database writes) only drop the offending message.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            FpmError::Io(_) | FpmError::ConnectionClosed | FpmError::Framing(_) => true,
            FpmError::Decode(e) => e.is_fatal(),
            _ => false,
        }
    }
}

impl From<redis::RedisError> for FpmError {
    fn from(e: redis::RedisError) -> Self {
        FpmError::Database(e.to_string())
    }
}

/// Result type alias for fpmsyncd operations
pub type Result<T> = std::result::Result<T, FpmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FpmError::Framing(FramingError::LengthTooLong {
            length: 9000,
            max: 4096,
        });
        assert_eq!(
            err.to_string(),
            "Malformed FPM message: declared FPM message length 9000 exceeds the maximum 4096"
        );

        let err = FpmError::UnknownInterface(42);
        assert_eq!(err.to_string(), "Interface not found: index 42");
    }

    #[test]
    fn test_framing_errors_are_connection_fatal() {
        assert!(FpmError::from(FramingError::UnsupportedVersion(2)).is_connection_fatal());
        assert!(FpmError::ConnectionClosed.is_connection_fatal());
        assert!(
            FpmError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
                .is_connection_fatal()
        );
    }

    #[test]
    fn test_decode_error_classification() {
        let fatal = DecodeError::LengthMismatch {
            inner: 36,
            outer: 40,
        };
        assert!(fatal.is_fatal());
        assert!(FpmError::from(fatal).is_connection_fatal());

        let local = DecodeError::AttributeOverrun {
            offset: 28,
            length: 64,
            remaining: 8,
        };
        assert!(!local.is_fatal());
        assert!(!FpmError::from(local).is_connection_fatal());
    }

    #[test]
    fn test_handler_errors_are_not_fatal() {
        let err = FpmError::MissingAttribute {
            attribute: "RTA_OIF",
            context: "RTM_NEWROUTE",
        };
        assert!(!err.is_connection_fatal());
        assert!(!FpmError::Database("timeout".into()).is_connection_fatal());
    }
}
