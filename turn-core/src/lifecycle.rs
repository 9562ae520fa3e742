//! Client lifecycle state machine.
//!
//! Pure transitions only. The relay drives it from request handling and
//! timers and reads the phase back to decide how to answer.

/// Where a client 5-tuple is in its allocation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientPhase {
    /// No valid allocation; requests must authenticate.
    #[default]
    Unauthenticated,
    /// An authenticated Allocate is waiting on the relay allocator.
    Allocating,
    /// Allocation is live.
    Active,
    /// Lifetime elapsed without refresh.
    Expired,
    /// Released by a zero-lifetime refresh or by shutdown.
    Closed,
}

/// Inputs to [`ClientPhase::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Authenticated Allocate accepted for processing.
    AllocateRequested,
    /// Relay allocator returned an endpoint.
    AllocationSucceeded,
    /// Relay allocator failed.
    AllocationFailed,
    /// Non-zero Refresh, or a duplicate Allocate.
    Refreshed,
    /// Allocation lifetime elapsed.
    LifetimeElapsed,
    /// Refresh with LIFETIME=0.
    Deleted,
    /// Server is shutting down.
    Shutdown,
}

impl ClientPhase {
    /// Process an event and return the new phase.
    pub fn on_event(self, event: PhaseEvent) -> Self {
        match (self, event) {
            (_, PhaseEvent::Shutdown) => Self::Closed,

            (Self::Unauthenticated, PhaseEvent::AllocateRequested) => Self::Allocating,
            // A finished allocation can be replaced on the same 5-tuple.
            (Self::Expired | Self::Closed, PhaseEvent::AllocateRequested) => Self::Allocating,

            (Self::Allocating, PhaseEvent::AllocationSucceeded) => Self::Active,
            (Self::Allocating, PhaseEvent::AllocationFailed) => Self::Unauthenticated,

            (Self::Active, PhaseEvent::Refreshed) => Self::Active,
            (Self::Active, PhaseEvent::AllocateRequested) => Self::Active,
            (Self::Active, PhaseEvent::LifetimeElapsed) => Self::Expired,
            (Self::Active, PhaseEvent::Deleted) => Self::Closed,

            // Invalid transitions - stay in current phase
            (phase, _) => phase,
        }
    }

    /// Whether an allocation is live.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether the allocation has ended.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Expired | Self::Closed)
    }
}
