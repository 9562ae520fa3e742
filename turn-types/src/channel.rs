//! ChannelData framing (RFC 8656 section 12.4).

use std::ops::RangeInclusive;

use crate::error::WireError;

/// Channel numbers a client may bind.
pub const CHANNEL_RANGE: RangeInclusive<u16> = 0x4000..=0x4FFF;

const CHANNEL_HEADER_LEN: usize = 4;

/// Largest application payload one ChannelData frame can carry.
pub const MAX_CHANNEL_DATA: usize = u16::MAX as usize;

/// Whether `channel` may be used in ChannelBind.
pub fn is_valid_channel(channel: u16) -> bool {
    CHANNEL_RANGE.contains(&channel)
}

/// Whether a datagram's first byte marks ChannelData (0x40..=0x4F).
pub fn is_channel_data(first_byte: u8) -> bool {
    (0x40..=0x4F).contains(&first_byte)
}

/// A ChannelData message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Channel number.
    pub channel: u16,
    /// Application data.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Create a ChannelData message.
    pub fn new(channel: u16, data: Vec<u8>) -> Result<Self, WireError> {
        if !is_valid_channel(channel) {
            return Err(WireError::InvalidChannel(channel));
        }
        if data.len() > MAX_CHANNEL_DATA {
            return Err(WireError::TooLarge {
                len: data.len(),
                max: MAX_CHANNEL_DATA,
            });
        }
        Ok(Self { channel, data })
    }

    /// Decode one ChannelData datagram. Trailing padding is accepted.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < CHANNEL_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: CHANNEL_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let channel = u16::from_be_bytes([buf[0], buf[1]]);
        if !is_valid_channel(channel) {
            return Err(WireError::InvalidChannel(channel));
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let needed = CHANNEL_HEADER_LEN + length;
        if buf.len() < needed {
            return Err(WireError::Truncated {
                needed,
                actual: buf.len(),
            });
        }
        Ok(Self {
            channel,
            data: buf[CHANNEL_HEADER_LEN..needed].to_vec(),
        })
    }

    /// Encode without padding.
    ///
    /// Data past [`MAX_CHANNEL_DATA`] is cut so the length field always
    /// matches the bytes that follow it; [`ChannelData::new`] rejects such
    /// payloads up front.
    pub fn encode(&self) -> Vec<u8> {
        let data = &self.data[..self.data.len().min(MAX_CHANNEL_DATA)];
        let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
        let mut buf = Vec::with_capacity(CHANNEL_HEADER_LEN + data.len());
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(data);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let frame = ChannelData::new(0x4001, b"abc".to_vec()).unwrap();
        assert_eq!(frame.encode(), vec![0x40, 0x01, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(
            ChannelData::new(0x4001, vec![0; MAX_CHANNEL_DATA + 1]),
            Err(WireError::TooLarge {
                len: MAX_CHANNEL_DATA + 1,
                max: MAX_CHANNEL_DATA,
            })
        );
        let frame = ChannelData::new(0x4001, vec![7; MAX_CHANNEL_DATA]).unwrap();
        let raw = frame.encode();
        assert_eq!(&raw[2..4], &[0xFF, 0xFF]);
        assert_eq!(ChannelData::decode(&raw).unwrap(), frame);
    }

    #[test]
    fn encode_keeps_length_consistent_for_unchecked_frames() {
        let frame = ChannelData {
            channel: 0x4001,
            data: vec![1; MAX_CHANNEL_DATA + 10],
        };
        let raw = frame.encode();
        assert_eq!(raw.len(), 4 + MAX_CHANNEL_DATA);
        assert_eq!(ChannelData::decode(&raw).unwrap().data.len(), MAX_CHANNEL_DATA);
    }

    #[test]
    fn decode_accepts_padding() {
        let buf = [0x40, 0x01, 0x00, 0x03, b'a', b'b', b'c', 0x00];
        let frame = ChannelData::decode(&buf).unwrap();
        assert_eq!(frame.channel, 0x4001);
        assert_eq!(frame.data, b"abc");
    }

    #[test]
    fn decode_rejects_short_payload() {
        let buf = [0x40, 0x01, 0x00, 0x08, b'a'];
        assert!(matches!(
            ChannelData::decode(&buf),
            Err(WireError::Truncated { needed: 12, actual: 5 })
        ));
    }

    #[test]
    fn channel_range() {
        assert!(is_valid_channel(0x4000));
        assert!(is_valid_channel(0x4FFF));
        assert!(!is_valid_channel(0x3FFF));
        assert!(!is_valid_channel(0x5000));
        assert_eq!(
            ChannelData::new(0x5000, vec![]),
            Err(WireError::InvalidChannel(0x5000))
        );
        assert_eq!(
            ChannelData::decode(&[0x50, 0x00, 0x00, 0x00]),
            Err(WireError::InvalidChannel(0x5000))
        );
    }

    #[test]
    fn demux_first_byte() {
        assert!(is_channel_data(0x40));
        assert!(is_channel_data(0x4F));
        assert!(!is_channel_data(0x00));
        assert!(!is_channel_data(0x50));
    }
}
