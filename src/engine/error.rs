use ulid::Ulid;

use crate::model::AmenityKind;
use crate::store::StoreError;

/// How a missing booking was being looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Id(Ulid),
    Owner(String),
    Ledger(Ulid),
}

#[derive(Debug)]
pub enum EngineError {
    InvalidInterval(String),
    ResourceNotFound(Ulid),
    BookingNotFound(Lookup),
    LedgerEntryMissing { kind: AmenityKind, booking_id: Ulid },
    SlotAlreadyBooked { conflicting: Option<Ulid> },
    LimitExceeded(&'static str),
    StorageFailure(String),
    /// A push token with nothing queued for it.
    NotificationsNotFound,
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) => "22023",
            EngineError::ResourceNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::LedgerEntryMissing { .. }
            | EngineError::NotificationsNotFound => "P0002",
            EngineError::SlotAlreadyBooked { .. } => "23P01",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::StorageFailure(_) => "XX000",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::BookingNotFound(Lookup::Id(id)) => write!(f, "booking not found: {id}"),
            EngineError::BookingNotFound(Lookup::Owner(_)) => {
                write!(f, "no upcoming bookings for this user")
            }
            EngineError::BookingNotFound(Lookup::Ledger(id)) => {
                write!(f, "ledger entry not found: {id}")
            }
            EngineError::LedgerEntryMissing { kind, booking_id } => {
                write!(f, "no {kind} ledger entry for booking {booking_id}")
            }
            EngineError::SlotAlreadyBooked { conflicting: Some(id) } => {
                write!(f, "slot already booked (conflicts with booking {id})")
            }
            EngineError::SlotAlreadyBooked { conflicting: None } => write!(f, "slot already booked"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageFailure(e) => write!(f, "storage failure: {e}"),
            EngineError::NotificationsNotFound => write!(f, "no pending notifications for this token"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConstraintViolation { conflicting } => EngineError::SlotAlreadyBooked {
                conflicting: Some(conflicting),
            },
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            other => EngineError::StorageFailure(other.to_string()),
        }
    }
}
