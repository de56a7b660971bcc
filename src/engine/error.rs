use ulid::Ulid;

use crate::model::Span;

#[derive(Debug)]
pub enum EngineError {
    /// `start >= end`, time outside the day, or date outside the bookable years.
    InvalidRange(String),
    ResourceNotFound(Ulid),
    /// Unknown (or already cancelled) reservation id.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    HasReservations(Ulid),
    /// Overlap detected inside the atomic check-and-insert.
    Conflict {
        reservation_id: Ulid,
        span: Span,
    },
    /// Per-resource lock not acquired within the configured wait. Retryable.
    Timeout(Ulid),
    LimitExceeded(&'static str),
    /// Persistence failure. Never a conflict.
    Unavailable(String),
}

impl EngineError {
    /// Only a lock timeout is worth retrying verbatim; everything else needs
    /// different input or a healthy store.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }

    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidRange(_) => "22023",
            EngineError::ResourceNotFound(_) | EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::HasReservations(_) => "55006",
            EngineError::Conflict { .. } => "23P01",
            EngineError::Timeout(_) => "55P03",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Unavailable(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::NotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::HasReservations(id) => {
                write!(f, "cannot remove resource {id}: has confirmed reservations")
            }
            EngineError::Conflict { reservation_id, span } => {
                write!(f, "conflict with reservation: {reservation_id} {span}")
            }
            EngineError::Timeout(id) => {
                write!(f, "timed out waiting for resource {id}, retry the booking")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
