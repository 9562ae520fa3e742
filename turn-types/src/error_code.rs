//! STUN/TURN error response codes (RFC 5389 section 15.6, RFC 5766 section 15).

use std::fmt;

/// An ERROR-CODE value: a number in 300..=699 plus its reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(u16);

impl ErrorCode {
    /// 300 Try Alternate.
    pub const TRY_ALTERNATE: Self = Self(300);
    /// 400 Bad Request.
    pub const BAD_REQUEST: Self = Self(400);
    /// 401 Unauthorized.
    pub const UNAUTHORIZED: Self = Self(401);
    /// 403 Forbidden.
    pub const FORBIDDEN: Self = Self(403);
    /// 420 Unknown Attribute.
    pub const UNKNOWN_ATTRIBUTE: Self = Self(420);
    /// 437 Allocation Mismatch.
    pub const ALLOCATION_MISMATCH: Self = Self(437);
    /// 438 Stale Nonce.
    pub const STALE_NONCE: Self = Self(438);
    /// 440 Address Family not Supported.
    pub const ADDRESS_FAMILY_NOT_SUPPORTED: Self = Self(440);
    /// 441 Wrong Credentials.
    pub const WRONG_CREDENTIALS: Self = Self(441);
    /// 442 Unsupported Transport Protocol.
    pub const UNSUPPORTED_TRANSPORT_PROTOCOL: Self = Self(442);
    /// 486 Allocation Quota Reached.
    pub const ALLOCATION_QUOTA_REACHED: Self = Self(486);
    /// 500 Server Error.
    pub const SERVER_ERROR: Self = Self(500);
    /// 508 Insufficient Capacity.
    pub const INSUFFICIENT_CAPACITY: Self = Self(508);

    /// Wrap a raw code. Returns `None` outside 300..=699.
    pub fn new(code: u16) -> Option<Self> {
        (300..=699).contains(&code).then_some(Self(code))
    }

    /// The numeric code.
    pub fn code(self) -> u16 {
        self.0
    }

    /// Hundreds digit, as carried in the "Class" field of the attribute.
    pub fn class(self) -> u8 {
        (self.0 / 100) as u8
    }

    /// Remainder, as carried in the "Number" field of the attribute.
    pub fn number(self) -> u8 {
        (self.0 % 100) as u8
    }

    /// Standard reason phrase.
    pub fn reason(self) -> &'static str {
        match self.0 {
            300 => "Try Alternate",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            420 => "Unknown Attribute",
            437 => "Allocation Mismatch",
            438 => "Stale Nonce",
            440 => "Address Family not Supported",
            441 => "Wrong Credentials",
            442 => "Unsupported Transport Protocol",
            486 => "Allocation Quota Reached",
            500 => "Server Error",
            508 => "Insufficient Capacity",
            _ => "Unknown Error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_and_number_split() {
        assert_eq!(ErrorCode::STALE_NONCE.class(), 4);
        assert_eq!(ErrorCode::STALE_NONCE.number(), 38);
        assert_eq!(ErrorCode::INSUFFICIENT_CAPACITY.class(), 5);
        assert_eq!(ErrorCode::INSUFFICIENT_CAPACITY.number(), 8);
    }

    #[test]
    fn new_rejects_out_of_range() {
        assert!(ErrorCode::new(299).is_none());
        assert!(ErrorCode::new(700).is_none());
        assert_eq!(ErrorCode::new(401), Some(ErrorCode::UNAUTHORIZED));
    }

    #[test]
    fn display_includes_reason() {
        assert_eq!(ErrorCode::UNAUTHORIZED.to_string(), "401 Unauthorized");
    }
}
