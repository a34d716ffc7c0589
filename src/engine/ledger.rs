//! Ledger projection of a booking.
//!
//! Every live booking has exactly one ledger entry whose `details` are
//! positional: `[startISO, endISO, floorId, label, occupants]`. For a
//! meeting room the occupants slot joins every email with `,`; for a
//! cafeteria seat it holds the single occupant.

use crate::model::*;

const START: usize = 0;
const END: usize = 1;
const FLOOR: usize = 2;
const LABEL: usize = 3;
const OCCUPANTS: usize = 4;
const SLOTS: usize = 5;

fn occupants_slot(booking: &Booking) -> String {
    match booking.kind {
        AmenityKind::MeetingRoom => booking.occupants.join(","),
        AmenityKind::Cafeteria => booking.occupants.first().cloned().unwrap_or_default(),
    }
}

pub(crate) fn details_for(booking: &Booking) -> Vec<String> {
    vec![
        iso_ms(booking.span.start),
        iso_ms(booking.span.end),
        booking.floor_id.to_string(),
        booking.resource_label.clone(),
        occupants_slot(booking),
    ]
}

pub(crate) fn entry_for(booking: &Booking) -> NewLedgerEntry {
    NewLedgerEntry {
        kind: booking.kind,
        booking_id: booking.id,
        date: booking.date,
        owner: booking.owner.clone(),
        details: details_for(booking),
    }
}

/// Rewrite the slots that encode fields changed between `before` and
/// `after`. Untouched slots keep their stored text.
pub(crate) fn refresh(entry: &mut LedgerEntry, before: &Booking, after: &Booking) {
    if entry.details.len() < SLOTS {
        entry.details.resize(SLOTS, String::new());
    }
    let fresh = details_for(after);
    if before.span.start != after.span.start {
        entry.details[START] = fresh[START].clone();
    }
    if before.span.end != after.span.end {
        entry.details[END] = fresh[END].clone();
    }
    if before.floor_id != after.floor_id {
        entry.details[FLOOR] = fresh[FLOOR].clone();
    }
    if before.resource_label != after.resource_label {
        entry.details[LABEL] = fresh[LABEL].clone();
    }
    if before.occupants != after.occupants {
        entry.details[OCCUPANTS] = fresh[OCCUPANTS].clone();
    }
    entry.date = after.date;
}
