//! Storage contract consumed by the engine.
//!
//! The engine only ever sees these traits. [`MemoryStore`] is the
//! WAL-backed implementation the server runs on; any transactional
//! backend that can provide serializable isolation (or an exclusion
//! constraint on overlapping spans) can stand in for it.

mod memory;
mod table;
pub mod wal;

pub use memory::{MemoryStore, MemoryTx};

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    /// Exclusion constraint rejected an overlapping span.
    ConstraintViolation { conflicting: Ulid },
    /// Row referenced by an update does not exist.
    Missing(Ulid),
    LimitExceeded(&'static str),
    Io(String),
    /// Background WAL writer is gone.
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ConstraintViolation { conflicting } => {
                write!(f, "exclusion constraint violated by booking {conflicting}")
            }
            StoreError::Missing(id) => write!(f, "row {id} does not exist"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Io(e) => write!(f, "WAL error: {e}"),
            StoreError::Closed => write!(f, "WAL writer shut down"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Booking and ledger tables.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a serializable transaction over the booking and ledger tables.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    async fn find_booking(&self, kind: AmenityKind, id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Bookings whose span overlaps `span`, optionally narrowed to one
    /// resource and/or one calendar day.
    async fn bookings_overlapping(
        &self,
        kind: AmenityKind,
        resource_id: Option<Ulid>,
        date: Option<NaiveDate>,
        span: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Bookings dated on or after `from`.
    async fn bookings_from(&self, kind: AmenityKind, from: NaiveDate) -> Result<Vec<Booking>, StoreError>;

    async fn all_bookings(&self, kind: AmenityKind) -> Result<Vec<Booking>, StoreError>;

    async fn find_ledger_by_id(&self, id: Ulid) -> Result<Option<LedgerEntry>, StoreError>;

    /// Ledger entries owned by `owner` dated on or after `from`.
    async fn ledger_for_owner(&self, owner: &str, from: NaiveDate) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// A unit of work. Dropping it without [`Transaction::commit`] rolls back.
#[async_trait]
pub trait Transaction: Send {
    /// Insert a booking and assign its id. Fails with
    /// [`StoreError::ConstraintViolation`] if the span overlaps another
    /// booking on the same resource.
    async fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, StoreError>;

    async fn find_booking(&self, kind: AmenityKind, id: Ulid) -> Result<Option<Booking>, StoreError>;

    async fn bookings_overlapping(
        &self,
        kind: AmenityKind,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn update_booking(&mut self, booking: &Booking) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    async fn delete_booking(&mut self, kind: AmenityKind, id: Ulid) -> Result<bool, StoreError>;

    async fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError>;

    async fn find_ledger_entry(
        &self,
        booking_id: Ulid,
        kind: AmenityKind,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    async fn update_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    async fn delete_ledger_entry(&mut self, booking_id: Ulid, kind: AmenityKind) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>);
}

/// Read-only view of bookable resources.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn find_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError>;

    /// Resources of `kind` with `capacity >= min_capacity`, in catalog order.
    async fn resources_by_min_capacity(
        &self,
        kind: AmenityKind,
        min_capacity: u32,
    ) -> Result<Vec<Resource>, StoreError>;

    async fn count_resources(&self, kind: AmenityKind) -> Result<usize, StoreError>;
}

/// Identity lookups for owner tokens.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_email(&self, token: &str) -> Result<Option<String>, StoreError>;

    async fn push_token(&self, token: &str) -> Result<Option<String>, StoreError>;

    /// Every push token on file, ordered by owner token.
    async fn push_tokens(&self) -> Result<Vec<String>, StoreError>;
}
