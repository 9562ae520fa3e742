//! Lifetime policy for allocations, permissions and channel bindings.

use std::time::Duration;

/// Allocation lifetime used when the client asks for none (RFC 8656 section 3.2).
pub const DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(600);
/// Longest lifetime the server grants.
pub const MAX_ALLOCATION_LIFETIME: Duration = Duration::from_secs(3600);
/// Permission lifetime (fixed at 300s by RFC 8656 section 9).
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);
/// Channel binding lifetime (RFC 8656 section 12).
pub const CHANNEL_LIFETIME: Duration = Duration::from_secs(600);

/// How long each kind of state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimePolicy {
    /// Granted when LIFETIME is absent or below this.
    pub default_lifetime: Duration,
    /// Upper clamp for requested lifetimes.
    pub max_lifetime: Duration,
    /// Lifetime of each installed or refreshed permission.
    pub permission_lifetime: Duration,
    /// Lifetime of each installed or refreshed channel binding.
    pub channel_lifetime: Duration,
}

impl Default for LifetimePolicy {
    fn default() -> Self {
        Self {
            default_lifetime: DEFAULT_ALLOCATION_LIFETIME,
            max_lifetime: MAX_ALLOCATION_LIFETIME,
            permission_lifetime: PERMISSION_LIFETIME,
            channel_lifetime: CHANNEL_LIFETIME,
        }
    }
}

impl LifetimePolicy {
    /// Lifetime granted by an Allocate request.
    pub fn allocate_lifetime(&self, requested: Option<u32>) -> Duration {
        match requested {
            Some(secs) => Duration::from_secs(u64::from(secs))
                .max(self.default_lifetime)
                .min(self.max_lifetime),
            None => self.default_lifetime,
        }
    }

    /// Lifetime granted by a Refresh request. Zero means delete.
    pub fn refresh_lifetime(&self, requested: Option<u32>) -> Duration {
        match requested {
            None => self.default_lifetime,
            Some(0) => Duration::ZERO,
            Some(secs) => Duration::from_secs(u64::from(secs)).min(self.max_lifetime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_clamps_to_default_and_max() {
        let policy = LifetimePolicy::default();
        assert_eq!(policy.allocate_lifetime(None), Duration::from_secs(600));
        assert_eq!(policy.allocate_lifetime(Some(30)), Duration::from_secs(600));
        assert_eq!(policy.allocate_lifetime(Some(1200)), Duration::from_secs(1200));
        assert_eq!(policy.allocate_lifetime(Some(99_999)), Duration::from_secs(3600));
    }

    #[test]
    fn refresh_zero_deletes() {
        let policy = LifetimePolicy::default();
        assert_eq!(policy.refresh_lifetime(Some(0)), Duration::ZERO);
        assert_eq!(policy.refresh_lifetime(None), Duration::from_secs(600));
        assert_eq!(policy.refresh_lifetime(Some(60)), Duration::from_secs(60));
        assert_eq!(policy.refresh_lifetime(Some(7200)), Duration::from_secs(3600));
    }
}
