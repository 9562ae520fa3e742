//! STUN message header, method/class coding, decoding and building.

use std::fmt;
use std::net::SocketAddr;

use rand::RngCore;

use crate::attribute::{attr_type, Attribute};
use crate::error::WireError;
use crate::error_code::ErrorCode;
use crate::integrity::{fingerprint, hmac_sha1, verify_hmac_sha1, LongTermKey};

/// Fixed value in bytes 4..8 of every STUN header.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of the STUN header.
pub const HEADER_LEN: usize = 20;

const INTEGRITY_ATTR_LEN: usize = 4 + 20;
const FINGERPRINT_ATTR_LEN: usize = 4 + 4;

/// Largest body the 16-bit length field can describe, rounded down to the
/// 4-byte attribute alignment.
pub const MAX_BODY_LEN: usize = u16::MAX as usize & !3;

/// STUN/TURN methods handled by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// 0x001
    Binding,
    /// 0x003
    Allocate,
    /// 0x004
    Refresh,
    /// 0x006
    Send,
    /// 0x007
    Data,
    /// 0x008
    CreatePermission,
    /// 0x009
    ChannelBind,
}

impl Method {
    /// The 12-bit method number.
    pub fn code(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind => 0x009,
        }
    }

    /// Look up a method number.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x001 => Some(Method::Binding),
            0x003 => Some(Method::Allocate),
            0x004 => Some(Method::Refresh),
            0x006 => Some(Method::Send),
            0x007 => Some(Method::Data),
            0x008 => Some(Method::CreatePermission),
            0x009 => Some(Method::ChannelBind),
            _ => None,
        }
    }
}

/// Message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    /// Request (0b00)
    Request,
    /// Indication (0b01)
    Indication,
    /// Success response (0b10)
    SuccessResponse,
    /// Error response (0b11)
    ErrorResponse,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::SuccessResponse => 0b10,
            Class::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::SuccessResponse,
            _ => Class::ErrorResponse,
        }
    }
}

/// Method plus class, as carried in the 14-bit message type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    /// Method.
    pub method: Method,
    /// Class.
    pub class: Class,
}

impl MessageType {
    /// Create a message type.
    pub fn new(method: Method, class: Class) -> Self {
        Self { method, class }
    }

    /// Interleave method and class bits (RFC 5389 section 6).
    pub fn to_u16(self) -> u16 {
        let m = self.method.code();
        let c = self.class.bits();
        (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | ((c & 0b01) << 4) | ((c & 0b10) << 7)
    }

    /// Split a raw message type into method and class.
    pub fn from_u16(raw: u16) -> Result<Self, WireError> {
        if raw & 0xC000 != 0 {
            return Err(WireError::NotStun);
        }
        let c = ((raw >> 4) & 0b01) | ((raw >> 7) & 0b10);
        let m = (raw & 0x000F) | ((raw >> 1) & 0x0070) | ((raw >> 2) & 0x0F80);
        let method = Method::from_code(m).ok_or(WireError::UnknownMethod(m))?;
        Ok(Self {
            method,
            class: Class::from_bits(c),
        })
    }
}

/// 96-bit transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a random transaction ID.
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A decoded STUN message.
///
/// Keeps the received bytes so MESSAGE-INTEGRITY and FINGERPRINT can be
/// checked over exactly what was on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    typ: MessageType,
    tid: TransactionId,
    attributes: Vec<Attribute>,
    raw: Vec<u8>,
    integrity_offset: Option<usize>,
    fingerprint_offset: Option<usize>,
}

impl Message {
    /// Decode a datagram holding exactly one STUN message.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
        if raw_type & 0xC000 != 0 {
            return Err(WireError::NotStun);
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(WireError::BadMagicCookie(cookie));
        }
        if length % 4 != 0 {
            return Err(WireError::BadLength(length));
        }
        let end = HEADER_LEN + length;
        if buf.len() < end {
            return Err(WireError::Truncated {
                needed: end,
                actual: buf.len(),
            });
        }
        if buf.len() > end {
            return Err(WireError::BadLength(length));
        }

        let typ = MessageType::from_u16(raw_type)?;
        let mut tid_bytes = [0u8; 12];
        tid_bytes.copy_from_slice(&buf[8..20]);
        let tid = TransactionId(tid_bytes);

        let mut attributes = Vec::new();
        let mut integrity_offset = None;
        let mut fingerprint_offset = None;
        let mut offset = HEADER_LEN;

        while offset < end {
            if end - offset < 4 {
                return Err(WireError::Truncated {
                    needed: offset + 4,
                    actual: end,
                });
            }
            let attr_typ = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let value_start = offset + 4;
            let value_end = value_start + attr_len;
            if value_end > end {
                return Err(WireError::Truncated {
                    needed: value_end,
                    actual: end,
                });
            }
            let next = value_start + padded(attr_len);

            // Only FINGERPRINT may follow MESSAGE-INTEGRITY.
            if integrity_offset.is_some() && attr_typ != attr_type::FINGERPRINT {
                offset = next;
                continue;
            }

            let attr = Attribute::decode(attr_typ, &buf[value_start..value_end], &tid)?;
            match attr_typ {
                attr_type::MESSAGE_INTEGRITY => integrity_offset = Some(offset),
                attr_type::FINGERPRINT => fingerprint_offset = Some(offset),
                _ => {}
            }
            attributes.push(attr);
            if fingerprint_offset.is_some() {
                break;
            }
            offset = next;
        }

        Ok(Self {
            typ,
            tid,
            attributes,
            raw: buf.to_vec(),
            integrity_offset,
            fingerprint_offset,
        })
    }

    /// Re-encode the decoded attributes in order.
    ///
    /// Integrity and fingerprint values are written as stored, so this is
    /// byte-exact only for unmodified messages.
    pub fn encode(&self) -> Vec<u8> {
        let mut builder = MessageBuilder::new(self.typ.method, self.typ.class, self.tid);
        for attr in &self.attributes {
            builder.push(attr.clone());
        }
        builder.build()
    }

    /// Method and class.
    pub fn message_type(&self) -> MessageType {
        self.typ
    }

    /// Method.
    pub fn method(&self) -> Method {
        self.typ.method
    }

    /// Class.
    pub fn class(&self) -> Class {
        self.typ.class
    }

    /// Transaction ID.
    pub fn transaction_id(&self) -> TransactionId {
        self.tid
    }

    /// All decoded attributes in wire order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Bytes this message was decoded from.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// First attribute of the given type.
    pub fn get(&self, typ: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.typ() == typ)
    }

    /// Whether an attribute of the given type is present.
    pub fn has(&self, typ: u16) -> bool {
        self.get(typ).is_some()
    }

    /// USERNAME value.
    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// REALM value.
    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Realm(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// NONCE value.
    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Nonce(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// LIFETIME value in seconds.
    pub fn lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    /// REQUESTED-TRANSPORT protocol number.
    pub fn requested_transport(&self) -> Option<u8> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::RequestedTransport(p) => Some(*p),
            _ => None,
        })
    }

    /// CHANNEL-NUMBER value.
    pub fn channel_number(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ChannelNumber(n) => Some(*n),
            _ => None,
        })
    }

    /// DATA payload.
    pub fn data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Data(d) => Some(d.as_slice()),
            _ => None,
        })
    }

    /// ERROR-CODE value.
    pub fn error_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, .. } => Some(*code),
            _ => None,
        })
    }

    /// Every XOR-PEER-ADDRESS, in order. CreatePermission may carry several.
    pub fn xor_peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter_map(|a| match a {
                Attribute::XorPeerAddress(addr) => Some(*addr),
                _ => None,
            })
            .collect()
    }

    /// XOR-MAPPED-ADDRESS value.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// XOR-RELAYED-ADDRESS value.
    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Comprehension-required attribute types this implementation does not understand.
    pub fn unknown_comprehension_required(&self) -> Vec<u16> {
        self.attributes
            .iter()
            .map(Attribute::typ)
            .filter(|t| Attribute::is_comprehension_required(*t) && !Attribute::is_known(*t))
            .collect()
    }

    /// Whether MESSAGE-INTEGRITY is present.
    pub fn has_integrity(&self) -> bool {
        self.integrity_offset.is_some()
    }

    /// Verify MESSAGE-INTEGRITY under a long-term credential key.
    pub fn verify_integrity(&self, key: &LongTermKey) -> Result<(), WireError> {
        self.verify_integrity_with(key.as_bytes())
    }

    /// Verify MESSAGE-INTEGRITY under raw key bytes.
    pub fn verify_integrity_with(&self, key: &[u8]) -> Result<(), WireError> {
        let offset = self.integrity_offset.ok_or(WireError::IntegrityMissing)?;
        let tag = self
            .attributes
            .iter()
            .find_map(|a| match a {
                Attribute::MessageIntegrity(tag) => Some(*tag),
                _ => None,
            })
            .ok_or(WireError::IntegrityMissing)?;

        let mut prefix = self.raw[..offset].to_vec();
        set_length(&mut prefix, offset - HEADER_LEN + INTEGRITY_ATTR_LEN);
        if verify_hmac_sha1(key, &prefix, &tag) {
            Ok(())
        } else {
            Err(WireError::IntegrityMismatch)
        }
    }

    /// Verify FINGERPRINT.
    pub fn verify_fingerprint(&self) -> Result<(), WireError> {
        let offset = self.fingerprint_offset.ok_or(WireError::FingerprintMissing)?;
        let stored = self
            .attributes
            .iter()
            .find_map(|a| match a {
                Attribute::Fingerprint(crc) => Some(*crc),
                _ => None,
            })
            .ok_or(WireError::FingerprintMissing)?;

        let mut prefix = self.raw[..offset].to_vec();
        set_length(&mut prefix, offset - HEADER_LEN + FINGERPRINT_ATTR_LEN);
        if fingerprint(&prefix) == stored {
            Ok(())
        } else {
            Err(WireError::FingerprintMismatch)
        }
    }
}

/// Builds STUN messages.
///
/// MESSAGE-INTEGRITY and FINGERPRINT are computed at build time and must not
/// be pushed as attributes.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    typ: MessageType,
    tid: TransactionId,
    attributes: Vec<Attribute>,
    fingerprint: bool,
}

impl MessageBuilder {
    /// Start a message.
    pub fn new(method: Method, class: Class, tid: TransactionId) -> Self {
        Self {
            typ: MessageType::new(method, class),
            tid,
            attributes: Vec::new(),
            fingerprint: false,
        }
    }

    /// Success response to `request`.
    pub fn success(request: &Message) -> Self {
        Self::new(request.method(), Class::SuccessResponse, request.transaction_id())
    }

    /// Error response to `request` carrying ERROR-CODE.
    pub fn error(request: &Message, code: ErrorCode) -> Self {
        Self::new(request.method(), Class::ErrorResponse, request.transaction_id()).attr(
            Attribute::ErrorCode {
                code: code.code(),
                reason: code.reason().to_string(),
            },
        )
    }

    /// Append an attribute.
    pub fn attr(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Append an attribute in place.
    pub fn push(&mut self, attr: Attribute) {
        self.attributes.push(attr);
    }

    /// Append FINGERPRINT when building.
    pub fn with_fingerprint(mut self) -> Self {
        self.fingerprint = true;
        self
    }

    /// Encode without MESSAGE-INTEGRITY.
    ///
    /// Yields an empty buffer when the body does not fit the 16-bit length
    /// field; [`MessageBuilder::try_build`] reports that case instead.
    pub fn build(&self) -> Vec<u8> {
        self.encode(None).unwrap_or_default()
    }

    /// Encode with MESSAGE-INTEGRITY under `key`.
    pub fn build_with_integrity(&self, key: &LongTermKey) -> Vec<u8> {
        self.encode(Some(key.as_bytes())).unwrap_or_default()
    }

    /// Encode with MESSAGE-INTEGRITY under raw key bytes.
    pub fn build_with_integrity_key(&self, key: &[u8]) -> Vec<u8> {
        self.encode(Some(key)).unwrap_or_default()
    }

    /// Encode without MESSAGE-INTEGRITY, rejecting oversized messages.
    pub fn try_build(&self) -> Result<Vec<u8>, WireError> {
        self.encode(None)
    }

    /// Encode with MESSAGE-INTEGRITY under `key`, rejecting oversized messages.
    pub fn try_build_with_integrity(&self, key: &LongTermKey) -> Result<Vec<u8>, WireError> {
        self.encode(Some(key.as_bytes()))
    }

    fn encode(&self, key: Option<&[u8]>) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&self.typ.to_u16().to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(self.tid.as_bytes());

        for attr in &self.attributes {
            write_attribute(&mut buf, attr.typ(), &attr.encode_value(&self.tid))?;
        }

        let trailer = key.map_or(0, |_| INTEGRITY_ATTR_LEN)
            + if self.fingerprint { FINGERPRINT_ATTR_LEN } else { 0 };
        let total = buf.len() - HEADER_LEN + trailer;
        if total > MAX_BODY_LEN {
            return Err(WireError::TooLarge {
                len: total,
                max: MAX_BODY_LEN,
            });
        }

        if let Some(key) = key {
            let body = buf.len() - HEADER_LEN;
            set_length(&mut buf, body + INTEGRITY_ATTR_LEN);
            let mac = hmac_sha1(key, &buf);
            write_attribute(&mut buf, attr_type::MESSAGE_INTEGRITY, &mac)?;
        }

        if self.fingerprint {
            let body = buf.len() - HEADER_LEN;
            set_length(&mut buf, body + FINGERPRINT_ATTR_LEN);
            let crc = fingerprint(&buf);
            write_attribute(&mut buf, attr_type::FINGERPRINT, &crc.to_be_bytes())?;
        }

        let body = buf.len() - HEADER_LEN;
        set_length(&mut buf, body);
        Ok(buf)
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn write_attribute(buf: &mut Vec<u8>, typ: u16, value: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::TooLarge {
        len: value.len(),
        max: MAX_BODY_LEN,
    })?;
    buf.extend_from_slice(&typ.to_be_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + padded(value.len()) - value.len(), 0);
    Ok(())
}

// Callers have already bounded `length` by MAX_BODY_LEN or a decoded header.
fn set_length(buf: &mut [u8], length: usize) {
    let bytes = u16::try_from(length).unwrap_or(u16::MAX).to_be_bytes();
    buf[2] = bytes[0];
    buf[3] = bytes[1];
}

/// Whether a datagram's first byte marks a STUN message.
pub fn is_stun(first_byte: u8) -> bool {
    first_byte & 0xC0 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::long_term_key;

    /// RFC 5769 section 2.1 sample request.
    fn rfc5769_request() -> Vec<u8> {
        let mut buf = hex::decode("000100582112a442b7e7a701bc34d686fa87dfae80220010").unwrap();
        buf.extend_from_slice(b"STUN test client");
        buf.extend_from_slice(
            &hex::decode(concat!(
                "002400046e0001ff",
                "80290008932ff9b151263b36",
                "000600096576746a3a6836765920202000",
                "0800149aeaa70cbfd8cb56781ef2b5b2d3f249c1b571a2",
                "80280004e57a3bcf"
            ))
            .unwrap(),
        );
        buf
    }

    #[test]
    fn message_type_interleaving() {
        let t = MessageType::new(Method::Allocate, Class::Request);
        assert_eq!(t.to_u16(), 0x0003);
        let t = MessageType::new(Method::Allocate, Class::SuccessResponse);
        assert_eq!(t.to_u16(), 0x0103);
        let t = MessageType::new(Method::Allocate, Class::ErrorResponse);
        assert_eq!(t.to_u16(), 0x0113);
        let t = MessageType::new(Method::Send, Class::Indication);
        assert_eq!(t.to_u16(), 0x0016);
        let t = MessageType::new(Method::Data, Class::Indication);
        assert_eq!(t.to_u16(), 0x0017);
        let t = MessageType::new(Method::ChannelBind, Class::SuccessResponse);
        assert_eq!(t.to_u16(), 0x0109);

        for raw in [0x0001, 0x0101, 0x0111, 0x0004, 0x0118, 0x0016] {
            assert_eq!(MessageType::from_u16(raw).unwrap().to_u16(), raw);
        }
    }

    #[test]
    fn unknown_method_rejected() {
        assert_eq!(
            MessageType::from_u16(0x000A),
            Err(WireError::UnknownMethod(0x00A))
        );
    }

    #[test]
    fn decode_rfc5769_request() {
        let raw = rfc5769_request();
        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.method(), Method::Binding);
        assert_eq!(msg.class(), Class::Request);
        assert_eq!(msg.username(), Some("evtj:h6vY"));
        assert!(msg.has_integrity());
        msg.verify_integrity_with(b"VOkJxbRl1RmTxUk/WvJxBt").unwrap();
        msg.verify_fingerprint().unwrap();
        assert_eq!(
            msg.verify_integrity_with(b"wrong"),
            Err(WireError::IntegrityMismatch)
        );
        // PRIORITY (0x0024) is comprehension-required and unknown here.
        assert_eq!(msg.unknown_comprehension_required(), vec![0x0024]);
    }

    #[test]
    fn decode_rejects_bad_magic_cookie() {
        let mut raw = rfc5769_request();
        raw[4] = 0;
        assert!(matches!(
            Message::decode(&raw),
            Err(WireError::BadMagicCookie(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated() {
        let raw = rfc5769_request();
        assert!(matches!(
            Message::decode(&raw[..30]),
            Err(WireError::Truncated { .. })
        ));
        assert!(matches!(
            Message::decode(&raw[..10]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut raw = rfc5769_request();
        raw.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(Message::decode(&raw), Err(WireError::BadLength(_))));
    }

    #[test]
    fn decode_rejects_channel_data_prefix() {
        let raw = [0x40, 0x00, 0x00, 0x00];
        assert!(Message::decode(&raw).is_err());
        let mut raw = rfc5769_request();
        raw[0] = 0x80;
        assert_eq!(Message::decode(&raw).unwrap_err(), WireError::NotStun);
    }

    #[test]
    fn build_and_verify_with_long_term_key() {
        let key = long_term_key("room-42", "rtchat.io", "s3cr3t");
        let tid = TransactionId::random();
        let raw = MessageBuilder::new(Method::Allocate, Class::Request, tid)
            .attr(Attribute::RequestedTransport(crate::attribute::PROTO_UDP))
            .attr(Attribute::Username("room-42".into()))
            .attr(Attribute::Realm("rtchat.io".into()))
            .attr(Attribute::Nonce("abc".into()))
            .with_fingerprint()
            .build_with_integrity(&key);

        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.transaction_id(), tid);
        assert_eq!(msg.nonce(), Some("abc"));
        msg.verify_integrity(&key).unwrap();
        msg.verify_fingerprint().unwrap();

        let other = long_term_key("room-42", "rtchat.io", "nope");
        assert_eq!(
            msg.verify_integrity(&other),
            Err(WireError::IntegrityMismatch)
        );
    }

    #[test]
    fn tampered_message_fails_integrity() {
        let key = long_term_key("u", "r", "p");
        let mut raw = MessageBuilder::new(Method::Refresh, Class::Request, TransactionId::random())
            .attr(Attribute::Lifetime(600))
            .build_with_integrity(&key);
        // Flip a bit in the LIFETIME value.
        raw[HEADER_LEN + 7] ^= 1;
        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.verify_integrity(&key), Err(WireError::IntegrityMismatch));
    }

    #[test]
    fn attributes_after_integrity_are_ignored() {
        let key = long_term_key("u", "r", "p");
        let mut raw = MessageBuilder::new(Method::Refresh, Class::Request, TransactionId::random())
            .build_with_integrity(&key);
        // Append LIFETIME after MESSAGE-INTEGRITY and fix up the length.
        raw.extend_from_slice(&[0x00, 0x0D, 0x00, 0x04, 0, 0, 0, 0]);
        let len = (raw.len() - HEADER_LEN) as u16;
        raw[2..4].copy_from_slice(&len.to_be_bytes());

        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.lifetime(), None);
        msg.verify_integrity(&key).unwrap();
    }

    #[test]
    fn oversized_message_is_refused() {
        let key = long_term_key("u", "r", "p");
        let builder = MessageBuilder::new(Method::Data, Class::Indication, TransactionId::random())
            .attr(Attribute::Data(vec![0; MAX_BODY_LEN - 8]))
            .attr(Attribute::Lifetime(1));
        assert!(matches!(
            builder.try_build(),
            Err(WireError::TooLarge { max: MAX_BODY_LEN, .. })
        ));
        assert!(builder.build().is_empty());

        let single = MessageBuilder::new(Method::Data, Class::Indication, TransactionId::random())
            .attr(Attribute::Data(vec![0; usize::from(u16::MAX) + 1]));
        assert!(matches!(single.try_build(), Err(WireError::TooLarge { .. })));

        let fits = MessageBuilder::new(Method::Data, Class::Indication, TransactionId::random())
            .attr(Attribute::Data(vec![0; MAX_BODY_LEN - 4 - 24]));
        let raw = fits.try_build_with_integrity(&key).unwrap();
        assert_eq!(raw.len(), HEADER_LEN + MAX_BODY_LEN);
        let msg = Message::decode(&raw).unwrap();
        msg.verify_integrity(&key).unwrap();
    }

    #[test]
    fn missing_integrity_and_fingerprint_reported() {
        let raw = MessageBuilder::new(Method::Binding, Class::Request, TransactionId::random()).build();
        let msg = Message::decode(&raw).unwrap();
        assert!(!msg.has_integrity());
        assert_eq!(
            msg.verify_integrity_with(b"k"),
            Err(WireError::IntegrityMissing)
        );
        assert_eq!(msg.verify_fingerprint(), Err(WireError::FingerprintMissing));
    }

    #[test]
    fn error_builder_carries_code() {
        let req = Message::decode(
            &MessageBuilder::new(Method::Allocate, Class::Request, TransactionId::random()).build(),
        )
        .unwrap();
        let raw = MessageBuilder::error(&req, ErrorCode::UNAUTHORIZED)
            .attr(Attribute::Realm("rtchat.io".into()))
            .build();
        let resp = Message::decode(&raw).unwrap();
        assert_eq!(resp.class(), Class::ErrorResponse);
        assert_eq!(resp.error_code(), Some(401));
        assert_eq!(resp.realm(), Some("rtchat.io"));
        assert_eq!(resp.transaction_id(), req.transaction_id());
    }

    #[test]
    fn encode_reproduces_received_bytes() {
        let raw = rfc5769_request();
        let msg = Message::decode(&raw).unwrap();
        let again = Message::decode(&msg.encode()).unwrap();
        assert_eq!(again.username(), msg.username());
        // Padding bytes are re-emitted as zero, so compare attributes rather than raw.
        assert_eq!(again.attributes(), msg.attributes());
    }

    #[test]
    fn multiple_peer_addresses() {
        let tid = TransactionId::random();
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let raw = MessageBuilder::new(Method::CreatePermission, Class::Request, tid)
            .attr(Attribute::XorPeerAddress(a))
            .attr(Attribute::XorPeerAddress(b))
            .build();
        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.xor_peer_addresses(), vec![a, b]);
    }

    #[test]
    fn stun_demux() {
        assert!(is_stun(0x00));
        assert!(is_stun(0x01));
        assert!(!is_stun(0x40));
    }
}
