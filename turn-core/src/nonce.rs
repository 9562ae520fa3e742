//! Stateless nonces for the long-term credential handshake.
//!
//! A nonce is `hex(issued_secs) || hex(HMAC-SHA256(secret, issued_secs)[..16])`.
//! The server keeps no per-client nonce state: a nonce is accepted while its
//! MAC verifies and its age is below the configured lifetime.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Default nonce lifetime.
pub const DEFAULT_NONCE_LIFETIME: Duration = Duration::from_secs(600);

const TIMESTAMP_HEX_LEN: usize = 16;
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = TIMESTAMP_HEX_LEN + TAG_LEN * 2;

/// Result of [`NonceIssuer::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// Issued by this server and still within its lifetime.
    Fresh,
    /// Issued by this server but too old.
    Stale,
    /// Not a nonce this server issued.
    Invalid,
}

/// Issues and checks stateless nonces.
pub struct NonceIssuer {
    secret: Zeroizing<[u8; 32]>,
    lifetime: Duration,
}

impl NonceIssuer {
    /// Create an issuer with a server secret.
    pub fn new(secret: [u8; 32], lifetime: Duration) -> Self {
        Self {
            secret: Zeroizing::new(secret),
            lifetime,
        }
    }

    /// Configured nonce lifetime.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Issue a nonce stamped with `now_unix`.
    pub fn issue(&self, now_unix: u64) -> String {
        format!("{now_unix:016x}{}", hex::encode(self.tag(now_unix)))
    }

    /// Classify a nonce presented at `now_unix`.
    pub fn check(&self, nonce: &str, now_unix: u64) -> NonceStatus {
        if nonce.len() != NONCE_LEN || !nonce.is_ascii() {
            return NonceStatus::Invalid;
        }
        let (stamp_hex, tag_hex) = nonce.split_at(TIMESTAMP_HEX_LEN);
        let Ok(issued) = u64::from_str_radix(stamp_hex, 16) else {
            return NonceStatus::Invalid;
        };
        let Ok(tag) = hex::decode(tag_hex) else {
            return NonceStatus::Invalid;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_slice()) else {
            return NonceStatus::Invalid;
        };
        mac.update(&issued.to_be_bytes());
        if mac.verify_truncated_left(&tag).is_err() {
            return NonceStatus::Invalid;
        }

        if now_unix.saturating_sub(issued) >= self.lifetime.as_secs() {
            NonceStatus::Stale
        } else {
            NonceStatus::Fresh
        }
    }

    fn tag(&self, issued: u64) -> [u8; TAG_LEN] {
        let mut out = [0u8; TAG_LEN];
        if let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_slice()) {
            mac.update(&issued.to_be_bytes());
            out.copy_from_slice(&mac.finalize().into_bytes()[..TAG_LEN]);
        }
        out
    }
}

impl std::fmt::Debug for NonceIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceIssuer")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}
