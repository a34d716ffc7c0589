use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Calendar helpers ─────────────────────────────────────────────

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// UTC calendar day containing `t`.
pub fn day_of(t: Ms) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// Midnight UTC at the start of `date`, in ms.
pub fn day_start(date: NaiveDate) -> Ms {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

/// RFC 3339 rendering with millisecond precision and a `Z` suffix.
pub fn iso_ms(t: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

// ── Amenities ────────────────────────────────────────────────────

/// Which interval store a booking lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AmenityKind {
    MeetingRoom,
    Cafeteria,
}

impl AmenityKind {
    pub const ALL: [AmenityKind; 2] = [AmenityKind::MeetingRoom, AmenityKind::Cafeteria];

    /// Canonical tag, used for both booking rows and ledger rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            AmenityKind::MeetingRoom => "meeting_room",
            AmenityKind::Cafeteria => "cafeteria",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            AmenityKind::MeetingRoom => "meeting_room_bookings",
            AmenityKind::Cafeteria => "cafeteria_bookings",
        }
    }

    pub fn from_table_name(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table_name() == table)
    }
}

impl fmt::Display for AmenityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AmenityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meeting_room" => Ok(AmenityKind::MeetingRoom),
            "cafeteria" => Ok(AmenityKind::Cafeteria),
            other => Err(format!("unknown amenity: {other}")),
        }
    }
}

// ── Rows ─────────────────────────────────────────────────────────

/// A bookable unit (room or seat). Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub kind: AmenityKind,
    pub label: String,
    pub capacity: u32,
    pub floor_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub token: String,
    pub email: String,
    pub push_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub kind: AmenityKind,
    pub resource_id: Ulid,
    /// Display name copied from the catalog at booking time.
    pub resource_label: String,
    pub floor_id: u32,
    pub date: NaiveDate,
    pub span: Span,
    pub occupants: Vec<String>,
    pub owner: String,
    pub status: String,
}

/// A booking row before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub kind: AmenityKind,
    pub resource_id: Ulid,
    pub resource_label: String,
    pub floor_id: u32,
    pub date: NaiveDate,
    pub span: Span,
    pub occupants: Vec<String>,
    pub owner: String,
    pub status: String,
}

impl NewBooking {
    pub fn with_id(self, id: Ulid) -> Booking {
        Booking {
            id,
            kind: self.kind,
            resource_id: self.resource_id,
            resource_label: self.resource_label,
            floor_id: self.floor_id,
            date: self.date,
            span: self.span,
            occupants: self.occupants,
            owner: self.owner,
            status: self.status,
        }
    }
}

/// Denormalized projection of a booking, one per live booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Ulid,
    pub kind: AmenityKind,
    pub booking_id: Ulid,
    pub date: NaiveDate,
    pub owner: String,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub kind: AmenityKind,
    pub booking_id: Ulid,
    pub date: NaiveDate,
    pub owner: String,
    pub details: Vec<String>,
}

impl NewLedgerEntry {
    pub fn with_id(self, id: Ulid) -> LedgerEntry {
        LedgerEntry {
            id,
            kind: self.kind,
            booking_id: self.booking_id,
            date: self.date,
            owner: self.owner,
            details: self.details,
        }
    }
}

/// A scheduled push notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub time: Ms,
    pub title: String,
    pub message: String,
    pub token: String,
    /// Set on booking reminders, so they can follow the booking.
    pub booking_id: Option<Ulid>,
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingProposal {
    pub resource_id: Ulid,
    /// Derived from `start` when omitted.
    pub date: Option<NaiveDate>,
    pub start: Ms,
    pub end: Ms,
    pub occupants: Vec<String>,
    pub owner: String,
    pub status: Option<String>,
}

/// Partial update: `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub date: Option<NaiveDate>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub resource_id: Option<Ulid>,
    pub resource_label: Option<String>,
    pub floor_id: Option<u32>,
    pub occupants: Option<Vec<String>>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
    pub start: Ms,
    pub end: Ms,
    pub min_capacity: u32,
}

/// A committed booking paired with its ledger projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub booking: Booking,
    pub ledger: LedgerEntry,
}

/// The event types, flat with no nesting. A WAL record is one committed
/// transaction's events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceUpserted(Resource),
    ResourceDeleted { id: Ulid },
    UserUpserted(User),
    BookingInserted(Booking),
    BookingUpdated(Booking),
    BookingDeleted { kind: AmenityKind, id: Ulid },
    LedgerInserted(LedgerEntry),
    LedgerUpdated(LedgerEntry),
    LedgerDeleted { id: Ulid },
    NotificationScheduled(Notification),
    /// Sent, or cancelled along with its booking.
    NotificationRemoved { id: Ulid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn day_helpers_agree() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let midnight = day_start(date);
        assert_eq!(day_of(midnight), Some(date));
        assert_eq!(day_of(midnight + DAY_MS - 1), Some(date));
        assert_eq!(day_of(midnight + DAY_MS), date.succ_opt());
    }

    #[test]
    fn iso_matches_js_to_iso_string() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let nine = day_start(date) + 9 * 3_600_000;
        assert_eq!(iso_ms(nine), "2024-05-01T09:00:00.000Z");
    }

    #[test]
    fn amenity_tags_roundtrip() {
        for kind in AmenityKind::ALL {
            assert_eq!(kind.as_str().parse::<AmenityKind>(), Ok(kind));
            assert_eq!(AmenityKind::from_table_name(kind.table_name()), Some(kind));
        }
        assert!("Meeting Room".parse::<AmenityKind>().is_err());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let event = Event::BookingInserted(Booking {
            id: Ulid::new(),
            kind: AmenityKind::MeetingRoom,
            resource_id: Ulid::new(),
            resource_label: "Everest".into(),
            floor_id: 3,
            date,
            span: Span::new(day_start(date), day_start(date) + 1000),
            occupants: vec!["a@x.io".into(), "b@x.io".into()],
            owner: "tok".into(),
            status: "confirmed".into(),
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
