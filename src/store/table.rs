use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Interval index ───────────────────────────────────────────────

/// Booking spans on one resource, sorted by `span.start`.
#[derive(Debug, Default, Clone)]
pub(super) struct IntervalIndex {
    intervals: Vec<(Span, Ulid)>,
}

impl IntervalIndex {
    /// Insert maintaining sort order by span.start.
    fn insert(&mut self, span: Span, id: Ulid) {
        let pos = self
            .intervals
            .binary_search_by_key(&span.start, |(s, _)| s.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, (span, id));
    }

    fn remove(&mut self, id: Ulid) {
        if let Some(pos) = self.intervals.iter().position(|(_, i)| *i == id) {
            self.intervals.remove(pos);
        }
    }

    fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Ids whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    fn overlapping(&self, query: Span) -> impl Iterator<Item = Ulid> {
        let right_bound = self
            .intervals
            .partition_point(|(s, _)| s.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > query.start)
            .map(|(_, id)| *id)
    }
}

// ── Booking table (one per amenity kind) ─────────────────────────

#[derive(Debug, Default, Clone)]
pub(super) struct BookingTable {
    rows: HashMap<Ulid, Booking>,
    by_resource: HashMap<Ulid, IntervalIndex>,
}

impl BookingTable {
    pub fn get(&self, id: &Ulid) -> Option<&Booking> {
        self.rows.get(id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &Booking> {
        self.rows.values()
    }

    pub fn resource_load(&self, resource_id: &Ulid) -> usize {
        self.by_resource.get(resource_id).map_or(0, IntervalIndex::len)
    }

    fn insert(&mut self, booking: Booking) {
        self.by_resource
            .entry(booking.resource_id)
            .or_default()
            .insert(booking.span, booking.id);
        self.rows.insert(booking.id, booking);
    }

    fn remove(&mut self, id: &Ulid) -> Option<Booking> {
        let booking = self.rows.remove(id)?;
        if let Some(index) = self.by_resource.get_mut(&booking.resource_id) {
            index.remove(booking.id);
            if index.len() == 0 {
                self.by_resource.remove(&booking.resource_id);
            }
        }
        Some(booking)
    }

    pub fn overlapping(&self, resource_id: Ulid, span: Span) -> impl Iterator<Item = &Booking> {
        self.by_resource
            .get(&resource_id)
            .into_iter()
            .flat_map(move |index| index.overlapping(span))
            .filter_map(move |id| self.rows.get(&id))
    }

    pub fn overlapping_any(&self, span: Span) -> impl Iterator<Item = &Booking> {
        self.by_resource
            .values()
            .flat_map(move |index| index.overlapping(span))
            .filter_map(move |id| self.rows.get(&id))
    }

    /// First booking on `resource_id` overlapping `span`, ignoring `except`.
    pub fn first_conflict(&self, resource_id: Ulid, span: Span, except: Option<Ulid>) -> Option<Ulid> {
        self.overlapping(resource_id, span)
            .map(|b| b.id)
            .find(|id| Some(*id) != except)
    }
}

// ── Ledger table ─────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub(super) struct LedgerTable {
    rows: HashMap<Ulid, LedgerEntry>,
    by_booking: HashMap<(AmenityKind, Ulid), Ulid>,
}

impl LedgerTable {
    pub fn get(&self, id: &Ulid) -> Option<&LedgerEntry> {
        self.rows.get(id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.rows.values()
    }

    pub fn for_booking(&self, booking_id: &Ulid, kind: AmenityKind) -> Option<&LedgerEntry> {
        self.by_booking
            .get(&(kind, *booking_id))
            .and_then(|id| self.rows.get(id))
    }

    fn insert(&mut self, entry: LedgerEntry) {
        self.by_booking.insert((entry.kind, entry.booking_id), entry.id);
        self.rows.insert(entry.id, entry);
    }

    fn remove(&mut self, id: &Ulid) -> Option<LedgerEntry> {
        let entry = self.rows.remove(id)?;
        self.by_booking.remove(&(entry.kind, entry.booking_id));
        Some(entry)
    }
}

// ── Booking state: both booking tables plus the ledger ───────────

#[derive(Debug, Default, Clone)]
pub(super) struct BookingState {
    meeting_room: BookingTable,
    cafeteria: BookingTable,
    pub ledger: LedgerTable,
}

impl BookingState {
    pub fn table(&self, kind: AmenityKind) -> &BookingTable {
        match kind {
            AmenityKind::MeetingRoom => &self.meeting_room,
            AmenityKind::Cafeteria => &self.cafeteria,
        }
    }

    fn table_mut(&mut self, kind: AmenityKind) -> &mut BookingTable {
        match kind {
            AmenityKind::MeetingRoom => &mut self.meeting_room,
            AmenityKind::Cafeteria => &mut self.cafeteria,
        }
    }

    pub fn bookings_on_or_after(&self, kind: AmenityKind, from: NaiveDate) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .table(kind)
            .rows()
            .filter(|b| b.date >= from)
            .cloned()
            .collect();
        sort_bookings(&mut out);
        out
    }

    /// Apply an event and return the event that undoes it.
    /// Events for other tables are ignored and return `None`.
    pub fn apply(&mut self, event: &Event) -> Option<Event> {
        match event {
            Event::BookingInserted(b) => {
                self.table_mut(b.kind).insert(b.clone());
                Some(Event::BookingDeleted { kind: b.kind, id: b.id })
            }
            Event::BookingUpdated(b) => {
                let table = self.table_mut(b.kind);
                let old = table.remove(&b.id);
                table.insert(b.clone());
                Some(match old {
                    Some(old) => Event::BookingUpdated(old),
                    None => Event::BookingDeleted { kind: b.kind, id: b.id },
                })
            }
            Event::BookingDeleted { kind, id } => self
                .table_mut(*kind)
                .remove(id)
                .map(Event::BookingInserted),
            Event::LedgerInserted(e) => {
                self.ledger.insert(e.clone());
                Some(Event::LedgerDeleted { id: e.id })
            }
            Event::LedgerUpdated(e) => {
                let old = self.ledger.remove(&e.id);
                self.ledger.insert(e.clone());
                Some(match old {
                    Some(old) => Event::LedgerUpdated(old),
                    None => Event::LedgerDeleted { id: e.id },
                })
            }
            Event::LedgerDeleted { id } => self.ledger.remove(id).map(Event::LedgerInserted),
            _ => None,
        }
    }

    /// Events that recreate this state from nothing.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for kind in AmenityKind::ALL {
            let mut rows: Vec<&Booking> = self.table(kind).rows().collect();
            rows.sort_by_key(|b| b.id);
            events.extend(rows.into_iter().cloned().map(Event::BookingInserted));
        }
        let mut entries: Vec<&LedgerEntry> = self.ledger.rows().collect();
        entries.sort_by_key(|e| e.id);
        events.extend(entries.into_iter().cloned().map(Event::LedgerInserted));
        events
    }
}

/// Date, then start time, then id.
pub(super) fn sort_bookings(bookings: &mut [Booking]) {
    bookings.sort_by_key(|b| (b.date, b.span.start, b.id));
}

// ── Catalog state: resources and users ───────────────────────────

#[derive(Debug, Default, Clone)]
pub(super) struct CatalogState {
    /// Ordered by id, which is the catalog's natural order.
    pub resources: BTreeMap<Ulid, Resource>,
    pub users: HashMap<String, User>,
}

impl CatalogState {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ResourceUpserted(r) => {
                self.resources.insert(r.id, r.clone());
            }
            Event::ResourceDeleted { id } => {
                self.resources.remove(id);
            }
            Event::UserUpserted(u) => {
                self.users.insert(u.token.clone(), u.clone());
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .resources
            .values()
            .cloned()
            .map(Event::ResourceUpserted)
            .collect();
        let mut users: Vec<&User> = self.users.values().collect();
        users.sort_by(|a, b| a.token.cmp(&b.token));
        events.extend(users.into_iter().cloned().map(Event::UserUpserted));
        events
    }
}

// ── Notification queue state ─────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub(super) struct QueueState {
    by_time: BTreeMap<(Ms, Ulid), Notification>,
    times: HashMap<Ulid, Ms>,
}

impl QueueState {
    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn earliest(&self) -> Option<&Notification> {
        self.by_time.values().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.by_time.values()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.times.contains_key(id)
    }

    /// Ids of the reminders queued for `booking_id`.
    pub fn for_booking(&self, booking_id: Ulid) -> Vec<Ulid> {
        self.by_time
            .values()
            .filter(|n| n.booking_id == Some(booking_id))
            .map(|n| n.id)
            .collect()
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::NotificationScheduled(n) => {
                self.times.insert(n.id, n.time);
                self.by_time.insert((n.time, n.id), n.clone());
            }
            Event::NotificationRemoved { id } => {
                if let Some(time) = self.times.remove(id) {
                    self.by_time.remove(&(time, *id));
                }
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.by_time
            .values()
            .cloned()
            .map(Event::NotificationScheduled)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn booking(resource_id: Ulid, start: Ms, end: Ms) -> Booking {
        let base = day_start(date());
        Booking {
            id: Ulid::new(),
            kind: AmenityKind::MeetingRoom,
            resource_id,
            resource_label: "Everest".into(),
            floor_id: 1,
            date: date(),
            span: Span::new(base + start, base + end),
            occupants: vec![],
            owner: "tok".into(),
            status: "confirmed".into(),
        }
    }

    fn window(start: Ms, end: Ms) -> Span {
        let base = day_start(date());
        Span::new(base + start, base + end)
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let rid = Ulid::new();
        let mut state = BookingState::default();
        for (s, e) in [(H, 2 * H), (4 * H + H / 2, 6 * H), (10 * H, 11 * H)] {
            state.apply(&Event::BookingInserted(booking(rid, s, e)));
        }
        let table = state.table(AmenityKind::MeetingRoom);
        let hits: Vec<_> = table.overlapping(rid, window(5 * H, 8 * H)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, window(4 * H + H / 2, 6 * H));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let rid = Ulid::new();
        let mut state = BookingState::default();
        state.apply(&Event::BookingInserted(booking(rid, H, 2 * H)));
        let table = state.table(AmenityKind::MeetingRoom);
        assert_eq!(table.overlapping(rid, window(2 * H, 3 * H)).count(), 0);
        assert_eq!(table.overlapping(rid, window(0, H)).count(), 0);
    }

    #[test]
    fn overlapping_is_per_resource() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut state = BookingState::default();
        state.apply(&Event::BookingInserted(booking(a, H, 2 * H)));
        let table = state.table(AmenityKind::MeetingRoom);
        assert!(table.first_conflict(b, window(H, 2 * H), None).is_none());
        assert!(table.first_conflict(a, window(H, 2 * H), None).is_some());
        assert_eq!(table.overlapping_any(window(H, 2 * H)).count(), 1);
    }

    #[test]
    fn first_conflict_ignores_self() {
        let rid = Ulid::new();
        let b = booking(rid, H, 2 * H);
        let id = b.id;
        let mut state = BookingState::default();
        state.apply(&Event::BookingInserted(b));
        let table = state.table(AmenityKind::MeetingRoom);
        assert!(table.first_conflict(rid, window(H, 3 * H), Some(id)).is_none());
    }

    #[test]
    fn apply_returns_inverse() {
        let rid = Ulid::new();
        let original = booking(rid, H, 2 * H);
        let mut state = BookingState::default();
        let undo_insert = state.apply(&Event::BookingInserted(original.clone())).unwrap();

        let mut moved = original.clone();
        moved.span = window(3 * H, 4 * H);
        let undo_update = state.apply(&Event::BookingUpdated(moved)).unwrap();
        assert_eq!(undo_update, Event::BookingUpdated(original.clone()));

        state.apply(&undo_update);
        let table = state.table(AmenityKind::MeetingRoom);
        assert_eq!(table.get(&original.id), Some(&original));
        assert_eq!(table.overlapping(rid, window(H, 2 * H)).count(), 1);
        assert_eq!(table.overlapping(rid, window(3 * H, 4 * H)).count(), 0);

        state.apply(&undo_insert);
        assert!(state.table(AmenityKind::MeetingRoom).get(&original.id).is_none());
        assert_eq!(state.table(AmenityKind::MeetingRoom).resource_load(&rid), 0);
    }

    #[test]
    fn ledger_indexed_by_booking_and_kind() {
        let booking_id = Ulid::new();
        let entry = LedgerEntry {
            id: Ulid::new(),
            kind: AmenityKind::Cafeteria,
            booking_id,
            date: date(),
            owner: "tok".into(),
            details: vec![],
        };
        let mut state = BookingState::default();
        state.apply(&Event::LedgerInserted(entry.clone()));
        assert_eq!(state.ledger.for_booking(&booking_id, AmenityKind::Cafeteria), Some(&entry));
        assert!(state.ledger.for_booking(&booking_id, AmenityKind::MeetingRoom).is_none());

        state.apply(&Event::LedgerDeleted { id: entry.id });
        assert!(state.ledger.for_booking(&booking_id, AmenityKind::Cafeteria).is_none());
    }

    #[test]
    fn queue_orders_by_time() {
        let mut q = QueueState::default();
        let late = Notification {
            id: Ulid::new(),
            time: 2000,
            title: "late".into(),
            message: String::new(),
            token: "t".into(),
            booking_id: None,
        };
        let early = Notification {
            id: Ulid::new(),
            time: 1000,
            title: "early".into(),
            message: String::new(),
            token: "t".into(),
            booking_id: Some(Ulid::new()),
        };
        q.apply(&Event::NotificationScheduled(late.clone()));
        q.apply(&Event::NotificationScheduled(early.clone()));
        assert_eq!(q.earliest(), Some(&early));
        assert_eq!(q.for_booking(early.booking_id.unwrap()), vec![early.id]);
        q.apply(&Event::NotificationRemoved { id: early.id });
        assert_eq!(q.earliest(), Some(&late));
        assert_eq!(q.len(), 1);
    }
}
