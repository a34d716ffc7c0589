use std::collections::HashSet;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Units free at instant `now`: `total_units` minus the bookings whose
/// half-open span covers `now`, floored at zero.
///
/// A booking ending exactly at `now` has already released its unit; one
/// starting exactly at `now` holds it.
pub fn count_free(total_units: usize, bookings: &[Booking], now: Ms) -> usize {
    let covering = bookings
        .iter()
        .filter(|b| b.span.contains_instant(now))
        .count();
    total_units.saturating_sub(covering)
}

/// Candidates, in their given order, whose label is not taken by any of
/// the `busy` bookings.
///
/// Matching is by display label rather than resource id: two resources
/// sharing a label shadow each other.
pub fn free_resources(candidates: Vec<Resource>, busy: &[Booking]) -> Vec<Resource> {
    let taken: HashSet<&str> = busy.iter().map(|b| b.resource_label.as_str()).collect();
    candidates
        .into_iter()
        .filter(|r| !taken.contains(r.label.as_str()))
        .collect()
}
