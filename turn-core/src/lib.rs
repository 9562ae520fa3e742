//! # turn-core
//!
//! Pure TURN allocation logic for garlic-turn (no I/O, instant tests).
//!
//! This crate implements the allocation record and its tables, the client
//! lifecycle state machine, lifetime policy and stateless nonces without any
//! network I/O or clocks of its own.
//!
//! ## Design Philosophy
//!
//! Every operation takes the current [`Instant`](std::time::Instant) (or Unix
//! seconds) as an argument. The relay crate owns the clock, which keeps these
//! types deterministic and lets the relay run them under paused test time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocation;
pub mod channel;
pub mod lifecycle;
pub mod lifetime;
pub mod nonce;
pub mod permission;

pub use allocation::{Allocation, InactiveAllocation};
pub use channel::{ChannelBindError, ChannelTable};
pub use lifecycle::{ClientPhase, PhaseEvent};
pub use lifetime::{
    LifetimePolicy, CHANNEL_LIFETIME, DEFAULT_ALLOCATION_LIFETIME, MAX_ALLOCATION_LIFETIME,
    PERMISSION_LIFETIME,
};
pub use nonce::{NonceIssuer, NonceStatus, DEFAULT_NONCE_LIFETIME};
pub use permission::PermissionTable;
