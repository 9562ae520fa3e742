//! Request rate limiting.
//!
//! Two governor limiters guard the control path:
//! - a keyed limiter per client transport address (`limits.requests_per_minute`)
//! - a direct limiter across all clients (`limits.global_requests_per_second`)
//!
//! Only STUN requests are limited. ChannelData and Send indications are
//! gated by permissions instead.

use crate::config::LimitsConfig;
use crate::overlay::TransportAddr;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    client_limiter: Arc<KeyedLimiter<TransportAddr>>,
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("client_limiter", &"KeyedLimiter<TransportAddr>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero values are rejected by `Config::validate`; if one slips through
    /// it is treated as a quota of one.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let global_rps =
            NonZeroU32::new(config.global_requests_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            client_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            global_limiter: Arc::new(RateLimiter::direct(Quota::per_second(global_rps))),
        }
    }

    /// Check one request from `client` against both limiters.
    pub fn check_request(&self, client: &TransportAddr) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)?;
        self.client_limiter
            .check_key(client)
            .map_err(|_| RateLimitError::ClientLimitExceeded)
    }

    /// Number of tracked client keys.
    pub fn client_keys_count(&self) -> usize {
        self.client_limiter.len()
    }

    /// Evict entries for clients whose quota has fully recharged.
    pub fn shrink(&self) {
        self.client_limiter.retain_recent();
        self.client_limiter.shrink_to_fit();
    }
}

/// Why a request was rate limited.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many requests from this client.
    #[error("client request rate limit exceeded")]
    ClientLimitExceeded,
    /// Global request rate exceeded across all clients.
    #[error("global request rate limit exceeded")]
    GlobalLimitExceeded,
}
