//! slotsync Error Types
//!
//! Errors are grouped by the fault taxonomy the sync pipeline recovers from:
//! - `CodecError`: protocol faults (malformed or unrecognized inbound frames)
//! - `ConsistencyError`: slot counts outside their invariant range
//! - `TransportError`: transport faults (channel open/send/receive failures)
//! - `SelectError`: local refusals of a slot selection
//! - `ConfigError`: configuration loading and validation failures
//! - `SyncError`: top-level error that wraps all of the above

use thiserror::Error;

/// Inbound message could not be turned into a typed server message
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload is not valid JSON or does not have the expected shape
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// `type` field names a message kind this client does not understand
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// A field required for the given message type is absent
    #[error("message '{kind}' is missing required field '{field}'")]
    MissingField { kind: String, field: &'static str },
    /// A field is present but its value is unusable
    #[error("message '{kind}' has invalid field '{field}': {reason}")]
    InvalidField {
        kind: String,
        field: &'static str,
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn missing(kind: &str, field: &'static str) -> Self {
        Self::MissingField {
            kind: kind.to_string(),
            field,
        }
    }

    pub(crate) fn invalid(kind: &str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            kind: kind.to_string(),
            field,
            reason: reason.into(),
        }
    }
}

/// A slot record or slot mutation would break `0 <= bookings <= capacity`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("slot {time} has zero capacity")]
    ZeroCapacity { time: String },
    #[error("slot {time} has {bookings} bookings for capacity {capacity}")]
    Overbooked {
        time: String,
        bookings: u32,
        capacity: u32,
    },
    #[error("slot {time} released with no bookings")]
    Underflow { time: String },
    #[error("slot {time} is not part of the current snapshot")]
    UnknownSlot { time: String },
}

/// Channel-level failure
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("channel closed")]
    Closed,
}

/// Reasons a slot selection is refused without contacting the server
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("another claim is already in progress for {0}")]
    ClaimInProgress(String),
    #[error("slot data is stale; wait for the live feed to resume")]
    StaleData,
    #[error("no active subscription")]
    NotSubscribed,
    #[error("slot {0} does not exist for the current date")]
    UnknownSlot(String),
    #[error("slot {0} is not available")]
    Unavailable(String),
    #[error("session is shut down")]
    SessionClosed,
}

/// Configuration failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(String),
    #[error("config invalid [{field}]: {reason}")]
    Invalid { field: String, reason: String },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for slotsync
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
