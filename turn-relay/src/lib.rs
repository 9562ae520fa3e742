//! # garlic-turn-relay
//!
//! TURN/STUN relay whose relayed traffic travels over the I2P overlay.
//!
//! This crate implements a relay server that:
//! - Listens for STUN/TURN on an I2P datagram session opened through a SAM bridge
//! - Opens a fresh I2P session per allocation to reach peers
//! - Authenticates clients against a room registry (username = room, password = room secret)
//! - Refuses to authenticate anything arriving over conventional UDP
//!
//! ## Architecture
//!
//! ```text
//! Client ──┐  control session            relay session  ┌── Peer
//!          │  (rtcchat-turn)             (per alloc)    │
//!          ├────────────►┌──────────────┐◄──────────────┤
//!          │             │  TurnServer  │               │
//!          │             │  ┌────────┐  │               │
//!          │             │  │ rooms  │  │               │
//!          │             │  └────────┘  │               │
//!          │             └──────────────┘               │
//!          └──────────── I2P via SAM v3 bridge ─────────┘
//! ```
//!
//! ## Components
//!
//! - [`overlay`] - Transport Provider: SAM, conventional UDP and in-memory sessions
//! - [`allocator`] - Relay Allocator: one relay session per allocation
//! - [`auth`] - Credential Bridge over the room registry
//! - [`server`] - Relay Protocol Engine and server context

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address_book;
pub mod allocator;
pub mod auth;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod overlay;
mod relay;
pub mod server;
mod session;

pub use server::{FiveTuple, ListenerId, ServerParts, TurnServer};
