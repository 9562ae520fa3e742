//! Error types for the STUN/TURN wire format.

use thiserror::Error;

/// Errors that can occur while decoding or verifying wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes than the header or a declared length requires
    #[error("message truncated: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The magic cookie field is not 0x2112A442
    #[error("bad magic cookie: {0:#010x}")]
    BadMagicCookie(u32),

    /// Header length field is inconsistent with the datagram
    #[error("bad message length: {0}")]
    BadLength(usize),

    /// The two most significant bits of the message type are not zero
    #[error("not a STUN message")]
    NotStun,

    /// Method is not one this implementation speaks
    #[error("unknown method: {0:#06x}")]
    UnknownMethod(u16),

    /// Attribute value is malformed
    #[error("malformed attribute {typ:#06x}: {reason}")]
    BadAttribute {
        /// Attribute type.
        typ: u16,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// MESSAGE-INTEGRITY is absent
    #[error("message integrity missing")]
    IntegrityMissing,

    /// MESSAGE-INTEGRITY does not match the key
    #[error("message integrity mismatch")]
    IntegrityMismatch,

    /// FINGERPRINT is absent
    #[error("fingerprint missing")]
    FingerprintMissing,

    /// FINGERPRINT does not match the message
    #[error("fingerprint mismatch")]
    FingerprintMismatch,

    /// Channel number outside the allowed range
    #[error("invalid channel number: {0:#06x}")]
    InvalidChannel(u16),

    /// Payload does not fit a 16-bit length field
    #[error("payload of {len} bytes exceeds {max}")]
    TooLarge {
        /// Bytes offered.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WireError::UnknownMethod(0x0abc);
        assert_eq!(err.to_string(), "unknown method: 0x0abc");

        let err = WireError::BadMagicCookie(0xdeadbeef);
        assert_eq!(err.to_string(), "bad magic cookie: 0xdeadbeef");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }
}
