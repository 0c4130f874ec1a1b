use std::fmt;

use thiserror::Error;
use ulid::Ulid;

/// Why an admission was refused. The two reasons are reported separately so
/// a client can tell "someone else got it" from "the professional is away".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    AlreadyBooked { booking_id: Ulid },
    Blocked { blocked_id: Ulid },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::AlreadyBooked { .. } => f.write_str("Slot already booked"),
            ConflictReason::Blocked { .. } => f.write_str("Slot is blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    /// The professional has never configured (or has deleted) their schedule.
    Availability(String),
    Booking(Ulid),
    BlockedTime(Ulid),
    Exception(chrono::NaiveDate),
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFound::Availability(pid) => {
                write!(f, "no availability configured for professional {pid}")
            }
            NotFound::Booking(id) => write!(f, "booking {id}"),
            NotFound::BlockedTime(id) => write!(f, "blocked time {id}"),
            NotFound::Exception(date) => write!(f, "exception date {date}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(ConflictReason),
    #[error("not found: {0}")]
    NotFound(NotFound),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Only persistence failures may be retried, and only by the caller
    /// re-running the whole request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(ConflictReason::AlreadyBooked { .. }) => "already_booked",
            EngineError::Conflict(ConflictReason::Blocked { .. }) => "blocked",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Store(_) => "store",
        }
    }
}
