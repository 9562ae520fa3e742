//! Error types for garlic-turn.

use turn_types::WireError;

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The server could not bring up its control session.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] TransportError),

    /// Relay allocator could not be constructed.
    #[error("relay allocator: {0}")]
    Allocator(#[from] AllocationError),

    /// Wire format error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from opening or using overlay sessions.
///
/// The first three are open failures and are retryable with a fresh name.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The SAM bridge could not be reached or did not answer in time.
    #[error("bridge unreachable: {0}")]
    BridgeUnreachable(String),

    /// The session name or destination is already in use.
    #[error("session name conflict: {0}")]
    NameConflict(String),

    /// The bridge or the overlay refused the session.
    #[error("overlay rejected session: {0}")]
    OverlayRejected(String),

    /// The session has been closed.
    #[error("session closed")]
    Closed,

    /// A destination this session cannot address.
    #[error("unroutable address: {0}")]
    Unroutable(String),

    /// I/O error on an established session.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Short stable name of the error kind, used in logs and error reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BridgeUnreachable(_) => "BridgeUnreachable",
            Self::NameConflict(_) => "NameConflict",
            Self::OverlayRejected(_) => "OverlayRejected",
            Self::Closed => "Closed",
            Self::Unroutable(_) => "Unroutable",
            Self::Io(_) => "Io",
        }
    }

    /// Whether a retry with a new session name may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BridgeUnreachable(_) | Self::NameConflict(_) | Self::OverlayRejected(_)
        )
    }
}

/// Errors from the relay allocator.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// This allocator does not provide the requested relay kind.
    #[error("relay kind not supported")]
    Unsupported,

    /// Opening the relay session failed.
    #[error("relay session: {0}")]
    Underlying(#[from] TransportError),

    /// The allocator was constructed with unusable settings.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfiguration(String),

    /// Server shutdown interrupted the allocation.
    #[error("allocation cancelled")]
    Cancelled,
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type alias for allocator operations.
pub type AllocationResult<T> = std::result::Result<T, AllocationError>;
