//! # turn-types
//!
//! STUN/TURN wire format for garlic-turn.
//!
//! This crate provides the message-level types shared by the relay crates:
//! - [`Message`], [`MessageBuilder`], [`Method`], [`Class`] - Framing and method/class coding
//! - [`Attribute`] - Typed attributes with XOR address coding
//! - [`ChannelData`] - Shortened framing for bound channels
//! - [`LongTermKey`] - Long-term credential keys, MESSAGE-INTEGRITY and FINGERPRINT
//! - [`ErrorCode`], [`WireError`] - Response codes and decode errors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
mod channel;
mod error;
mod error_code;
mod integrity;
mod message;

pub use attribute::{attr_type, Attribute, PROTO_TCP, PROTO_UDP};
pub use channel::{is_channel_data, is_valid_channel, ChannelData, CHANNEL_RANGE, MAX_CHANNEL_DATA};
pub use error::WireError;
pub use error_code::ErrorCode;
pub use integrity::{fingerprint, long_term_key, LongTermKey, FINGERPRINT_XOR};
pub use message::{
    is_stun, Class, Message, MessageBuilder, MessageType, Method, TransactionId, HEADER_LEN,
    MAGIC_COOKIE, MAX_BODY_LEN,
};
