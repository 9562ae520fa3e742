//! STUN/TURN attributes and their TLV value encodings.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::WireError;
use crate::message::{TransactionId, MAGIC_COOKIE};

/// Attribute type codepoints.
pub mod attr_type {
    /// MAPPED-ADDRESS
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    /// USERNAME
    pub const USERNAME: u16 = 0x0006;
    /// MESSAGE-INTEGRITY
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    /// ERROR-CODE
    pub const ERROR_CODE: u16 = 0x0009;
    /// UNKNOWN-ATTRIBUTES
    pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
    /// CHANNEL-NUMBER
    pub const CHANNEL_NUMBER: u16 = 0x000C;
    /// LIFETIME
    pub const LIFETIME: u16 = 0x000D;
    /// XOR-PEER-ADDRESS
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    /// DATA
    pub const DATA: u16 = 0x0013;
    /// REALM
    pub const REALM: u16 = 0x0014;
    /// NONCE
    pub const NONCE: u16 = 0x0015;
    /// XOR-RELAYED-ADDRESS
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    /// REQUESTED-ADDRESS-FAMILY (RFC 6156)
    pub const REQUESTED_ADDRESS_FAMILY: u16 = 0x0017;
    /// EVEN-PORT
    pub const EVEN_PORT: u16 = 0x0018;
    /// REQUESTED-TRANSPORT
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    /// DONT-FRAGMENT
    pub const DONT_FRAGMENT: u16 = 0x001A;
    /// XOR-MAPPED-ADDRESS
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    /// RESERVATION-TOKEN
    pub const RESERVATION_TOKEN: u16 = 0x0022;
    /// SOFTWARE
    pub const SOFTWARE: u16 = 0x8022;
    /// FINGERPRINT
    pub const FINGERPRINT: u16 = 0x8028;
}

/// IANA protocol number for UDP, as carried in REQUESTED-TRANSPORT.
pub const PROTO_UDP: u8 = 17;
/// IANA protocol number for TCP, as carried in REQUESTED-TRANSPORT (RFC 6062).
pub const PROTO_TCP: u8 = 6;

/// Address family value for IPv4.
pub const FAMILY_IPV4: u8 = 0x01;
/// Address family value for IPv6.
pub const FAMILY_IPV6: u8 = 0x02;

const MAX_USERNAME_LEN: usize = 513;
const MAX_TEXT_CHARS: usize = 763;

/// A decoded attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Reflexive address, not obfuscated.
    MappedAddress(SocketAddr),
    /// Reflexive address of the client.
    XorMappedAddress(SocketAddr),
    /// A peer's address as seen from the relay.
    XorPeerAddress(SocketAddr),
    /// Relayed transport address of an allocation.
    XorRelayedAddress(SocketAddr),
    /// Long-term credential user name.
    Username(String),
    /// Authentication realm.
    Realm(String),
    /// Server-issued nonce.
    Nonce(String),
    /// Free-form software description.
    Software(String),
    /// Error response code and reason.
    ErrorCode {
        /// Numeric code, 300..=699.
        code: u16,
        /// Reason phrase.
        reason: String,
    },
    /// Comprehension-required attributes the server did not understand.
    UnknownAttributes(Vec<u16>),
    /// Channel number for ChannelBind.
    ChannelNumber(u16),
    /// Allocation lifetime in seconds.
    Lifetime(u32),
    /// Application payload of Send/Data indications.
    Data(Vec<u8>),
    /// Requested relay protocol (IANA protocol number).
    RequestedTransport(u8),
    /// Requested relay address family.
    RequestedAddressFamily(u8),
    /// Request for an even port; the flag asks to reserve the next port too.
    EvenPort(bool),
    /// Set DF on relayed packets.
    DontFragment,
    /// Token for a previously reserved relay address.
    ReservationToken([u8; 8]),
    /// HMAC-SHA1 over the preceding message.
    MessageIntegrity([u8; 20]),
    /// CRC-32 over the preceding message, XOR 0x5354554E.
    Fingerprint(u32),
    /// Anything else, kept verbatim.
    Unknown {
        /// Attribute type.
        typ: u16,
        /// Raw value, unpadded.
        value: Vec<u8>,
    },
}

impl Attribute {
    /// The attribute type codepoint.
    pub fn typ(&self) -> u16 {
        use attr_type::*;
        match self {
            Attribute::MappedAddress(_) => MAPPED_ADDRESS,
            Attribute::XorMappedAddress(_) => XOR_MAPPED_ADDRESS,
            Attribute::XorPeerAddress(_) => XOR_PEER_ADDRESS,
            Attribute::XorRelayedAddress(_) => XOR_RELAYED_ADDRESS,
            Attribute::Username(_) => USERNAME,
            Attribute::Realm(_) => REALM,
            Attribute::Nonce(_) => NONCE,
            Attribute::Software(_) => SOFTWARE,
            Attribute::ErrorCode { .. } => ERROR_CODE,
            Attribute::UnknownAttributes(_) => UNKNOWN_ATTRIBUTES,
            Attribute::ChannelNumber(_) => CHANNEL_NUMBER,
            Attribute::Lifetime(_) => LIFETIME,
            Attribute::Data(_) => DATA,
            Attribute::RequestedTransport(_) => REQUESTED_TRANSPORT,
            Attribute::RequestedAddressFamily(_) => REQUESTED_ADDRESS_FAMILY,
            Attribute::EvenPort(_) => EVEN_PORT,
            Attribute::DontFragment => DONT_FRAGMENT,
            Attribute::ReservationToken(_) => RESERVATION_TOKEN,
            Attribute::MessageIntegrity(_) => MESSAGE_INTEGRITY,
            Attribute::Fingerprint(_) => FINGERPRINT,
            Attribute::Unknown { typ, .. } => *typ,
        }
    }

    /// Whether this implementation understands the given attribute type.
    pub fn is_known(typ: u16) -> bool {
        use attr_type::*;
        matches!(
            typ,
            MAPPED_ADDRESS
                | USERNAME
                | MESSAGE_INTEGRITY
                | ERROR_CODE
                | UNKNOWN_ATTRIBUTES
                | CHANNEL_NUMBER
                | LIFETIME
                | XOR_PEER_ADDRESS
                | DATA
                | REALM
                | NONCE
                | XOR_RELAYED_ADDRESS
                | REQUESTED_ADDRESS_FAMILY
                | EVEN_PORT
                | REQUESTED_TRANSPORT
                | DONT_FRAGMENT
                | XOR_MAPPED_ADDRESS
                | RESERVATION_TOKEN
                | SOFTWARE
                | FINGERPRINT
        )
    }

    /// Comprehension-required attributes occupy 0x0000..=0x7FFF.
    pub fn is_comprehension_required(typ: u16) -> bool {
        typ < 0x8000
    }

    /// Encode the attribute value (unpadded, without the TLV header).
    pub fn encode_value(&self, tid: &TransactionId) -> Vec<u8> {
        match self {
            Attribute::MappedAddress(addr) => encode_address(*addr),
            Attribute::XorMappedAddress(addr)
            | Attribute::XorPeerAddress(addr)
            | Attribute::XorRelayedAddress(addr) => encode_xor_address(*addr, tid),
            Attribute::Username(s)
            | Attribute::Realm(s)
            | Attribute::Nonce(s)
            | Attribute::Software(s) => s.as_bytes().to_vec(),
            Attribute::ErrorCode { code, reason } => {
                let mut v = Vec::with_capacity(4 + reason.len());
                v.extend_from_slice(&[0, 0, (code / 100) as u8 & 0x07, (code % 100) as u8]);
                v.extend_from_slice(reason.as_bytes());
                v
            }
            Attribute::UnknownAttributes(types) => {
                types.iter().flat_map(|t| t.to_be_bytes()).collect()
            }
            Attribute::ChannelNumber(n) => {
                let mut v = n.to_be_bytes().to_vec();
                v.extend_from_slice(&[0, 0]);
                v
            }
            Attribute::Lifetime(secs) => secs.to_be_bytes().to_vec(),
            Attribute::Data(data) => data.clone(),
            Attribute::RequestedTransport(proto) => vec![*proto, 0, 0, 0],
            Attribute::RequestedAddressFamily(family) => vec![*family, 0, 0, 0],
            Attribute::EvenPort(reserve) => vec![if *reserve { 0x80 } else { 0 }],
            Attribute::DontFragment => Vec::new(),
            Attribute::ReservationToken(token) => token.to_vec(),
            Attribute::MessageIntegrity(mac) => mac.to_vec(),
            Attribute::Fingerprint(crc) => crc.to_be_bytes().to_vec(),
            Attribute::Unknown { value, .. } => value.clone(),
        }
    }

    /// Decode an attribute value of the given type.
    pub fn decode(typ: u16, value: &[u8], tid: &TransactionId) -> Result<Self, WireError> {
        use attr_type::*;
        let attr = match typ {
            MAPPED_ADDRESS => Attribute::MappedAddress(decode_address(typ, value)?),
            XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(decode_xor_address(typ, value, tid)?),
            XOR_PEER_ADDRESS => Attribute::XorPeerAddress(decode_xor_address(typ, value, tid)?),
            XOR_RELAYED_ADDRESS => {
                Attribute::XorRelayedAddress(decode_xor_address(typ, value, tid)?)
            }
            USERNAME => {
                if value.len() > MAX_USERNAME_LEN {
                    return Err(WireError::BadAttribute {
                        typ,
                        reason: "username too long",
                    });
                }
                Attribute::Username(decode_text(typ, value)?)
            }
            REALM => Attribute::Realm(decode_text(typ, value)?),
            NONCE => Attribute::Nonce(decode_text(typ, value)?),
            SOFTWARE => Attribute::Software(decode_text(typ, value)?),
            ERROR_CODE => {
                if value.len() < 4 {
                    return Err(short(typ));
                }
                let class = (value[2] & 0x07) as u16;
                let number = value[3] as u16;
                if !(3..=6).contains(&class) || number > 99 {
                    return Err(WireError::BadAttribute {
                        typ,
                        reason: "error code out of range",
                    });
                }
                Attribute::ErrorCode {
                    code: class * 100 + number,
                    reason: decode_text(typ, &value[4..])?,
                }
            }
            UNKNOWN_ATTRIBUTES => {
                if value.len() % 2 != 0 {
                    return Err(WireError::BadAttribute {
                        typ,
                        reason: "odd length",
                    });
                }
                Attribute::UnknownAttributes(
                    value
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            CHANNEL_NUMBER => {
                let v = fixed::<4>(typ, value)?;
                Attribute::ChannelNumber(u16::from_be_bytes([v[0], v[1]]))
            }
            LIFETIME => Attribute::Lifetime(u32::from_be_bytes(fixed::<4>(typ, value)?)),
            DATA => Attribute::Data(value.to_vec()),
            REQUESTED_TRANSPORT => Attribute::RequestedTransport(fixed::<4>(typ, value)?[0]),
            REQUESTED_ADDRESS_FAMILY => {
                Attribute::RequestedAddressFamily(fixed::<4>(typ, value)?[0])
            }
            EVEN_PORT => Attribute::EvenPort(fixed::<1>(typ, value)?[0] & 0x80 != 0),
            DONT_FRAGMENT => {
                if !value.is_empty() {
                    return Err(WireError::BadAttribute {
                        typ,
                        reason: "unexpected value",
                    });
                }
                Attribute::DontFragment
            }
            RESERVATION_TOKEN => Attribute::ReservationToken(fixed::<8>(typ, value)?),
            MESSAGE_INTEGRITY => Attribute::MessageIntegrity(fixed::<20>(typ, value)?),
            FINGERPRINT => Attribute::Fingerprint(u32::from_be_bytes(fixed::<4>(typ, value)?)),
            _ => Attribute::Unknown {
                typ,
                value: value.to_vec(),
            },
        };
        Ok(attr)
    }
}

fn short(typ: u16) -> WireError {
    WireError::BadAttribute {
        typ,
        reason: "value too short",
    }
}

fn fixed<const N: usize>(typ: u16, value: &[u8]) -> Result<[u8; N], WireError> {
    value.try_into().map_err(|_| WireError::BadAttribute {
        typ,
        reason: "unexpected value length",
    })
}

fn decode_text(typ: u16, value: &[u8]) -> Result<String, WireError> {
    let text = std::str::from_utf8(value).map_err(|_| WireError::BadAttribute {
        typ,
        reason: "not UTF-8",
    })?;
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(WireError::BadAttribute {
            typ,
            reason: "text too long",
        });
    }
    Ok(text.to_string())
}

fn encode_address(addr: SocketAddr) -> Vec<u8> {
    let mut v = Vec::with_capacity(20);
    v.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            v.push(FAMILY_IPV4);
            v.extend_from_slice(&addr.port().to_be_bytes());
            v.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            v.push(FAMILY_IPV6);
            v.extend_from_slice(&addr.port().to_be_bytes());
            v.extend_from_slice(&ip.octets());
        }
    }
    v
}

fn decode_address(typ: u16, value: &[u8]) -> Result<SocketAddr, WireError> {
    if value.len() < 4 {
        return Err(short(typ));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = match (value[1], value.len()) {
        (FAMILY_IPV4, 8) => {
            IpAddr::V4(Ipv4Addr::new(value[4], value[5], value[6], value[7]))
        }
        (FAMILY_IPV6, 20) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        (FAMILY_IPV4, _) | (FAMILY_IPV6, _) => {
            return Err(WireError::BadAttribute {
                typ,
                reason: "address length does not match family",
            })
        }
        _ => {
            return Err(WireError::BadAttribute {
                typ,
                reason: "unknown address family",
            })
        }
    };
    Ok(SocketAddr::new(ip, port))
}

/// XOR mask for an address: magic cookie followed by the transaction ID.
fn xor_mask(tid: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(tid.as_bytes());
    mask
}

fn apply_xor(value: &mut [u8], tid: &TransactionId) {
    let mask = xor_mask(tid);
    // Port is XORed with the high 16 bits of the cookie.
    value[2] ^= mask[0];
    value[3] ^= mask[1];
    for (byte, m) in value[4..].iter_mut().zip(mask.iter()) {
        *byte ^= m;
    }
}

fn encode_xor_address(addr: SocketAddr, tid: &TransactionId) -> Vec<u8> {
    let mut v = encode_address(addr);
    apply_xor(&mut v, tid);
    v
}

fn decode_xor_address(
    typ: u16,
    value: &[u8],
    tid: &TransactionId,
) -> Result<SocketAddr, WireError> {
    if value.len() < 8 {
        return Err(short(typ));
    }
    let mut plain = value.to_vec();
    apply_xor(&mut plain, tid);
    decode_address(typ, &plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> TransactionId {
        TransactionId::from_bytes([
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ])
    }

    #[test]
    fn xor_mapped_ipv4_matches_rfc5769_vector() {
        // RFC 5769 section 2.2: 192.0.2.1:32853
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let value = Attribute::XorMappedAddress(addr).encode_value(&tid());
        assert_eq!(value, hex::decode("0001a147e112a643").unwrap());

        let decoded = Attribute::decode(attr_type::XOR_MAPPED_ADDRESS, &value, &tid()).unwrap();
        assert_eq!(decoded, Attribute::XorMappedAddress(addr));
    }

    #[test]
    fn xor_mapped_ipv6_matches_rfc5769_vector() {
        // RFC 5769 section 2.3: [2001:db8:1234:5678:11:2233:4455:6677]:32853
        let addr: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853"
            .parse()
            .unwrap();
        let value = Attribute::XorMappedAddress(addr).encode_value(&tid());
        assert_eq!(
            value,
            hex::decode("0002a1470113a9faa5d3f179bc25f4b5bed2b9d9").unwrap()
        );
    }

    #[test]
    fn error_code_layout() {
        let attr = Attribute::ErrorCode {
            code: 438,
            reason: "Stale Nonce".into(),
        };
        let value = attr.encode_value(&tid());
        assert_eq!(&value[..4], &[0, 0, 4, 38]);
        let decoded = Attribute::decode(attr_type::ERROR_CODE, &value, &tid()).unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn error_code_class_out_of_range_rejected() {
        let value = [0, 0, 7, 0];
        assert!(Attribute::decode(attr_type::ERROR_CODE, &value, &tid()).is_err());
    }

    #[test]
    fn requested_transport_requires_four_bytes() {
        assert_eq!(
            Attribute::decode(attr_type::REQUESTED_TRANSPORT, &[17, 0, 0, 0], &tid()).unwrap(),
            Attribute::RequestedTransport(PROTO_UDP)
        );
        assert!(Attribute::decode(attr_type::REQUESTED_TRANSPORT, &[17], &tid()).is_err());
    }

    #[test]
    fn address_family_mismatch_rejected() {
        // IPv6 family with an IPv4-sized body
        let value = [0, FAMILY_IPV6, 0, 80, 1, 2, 3, 4];
        assert!(Attribute::decode(attr_type::MAPPED_ADDRESS, &value, &tid()).is_err());
    }

    #[test]
    fn username_length_limit() {
        let long = vec![b'a'; MAX_USERNAME_LEN + 1];
        assert!(Attribute::decode(attr_type::USERNAME, &long, &tid()).is_err());
    }

    #[test]
    fn unknown_attribute_kept_verbatim() {
        let decoded = Attribute::decode(0x7777, &[1, 2, 3], &tid()).unwrap();
        assert_eq!(
            decoded,
            Attribute::Unknown {
                typ: 0x7777,
                value: vec![1, 2, 3]
            }
        );
        assert!(!Attribute::is_known(0x7777));
        assert!(Attribute::is_comprehension_required(0x7777));
        assert!(!Attribute::is_comprehension_required(0x8022));
    }
}
