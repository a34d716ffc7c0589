use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::BookingEvent;
use crate::observability::{BOOKINGS_CREATED_TOTAL, BOOKINGS_REMOVED_TOTAL, BOOKING_CONFLICTS_TOTAL};

use super::conflict::{
    first_overlap, validate_day, validate_occupants, validate_owner, validate_span, validate_status,
};
use super::ledger;
use super::{Engine, EngineError, Lookup};

pub const DEFAULT_STATUS: &str = "confirmed";

fn count_conflict<T>(kind: AmenityKind, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(EngineError::SlotAlreadyBooked { .. }) = &result {
        metrics::counter!(BOOKING_CONFLICTS_TOTAL, "amenity" => kind.as_str()).increment(1);
    }
    result
}

impl Engine {
    /// Create a booking and its ledger entry in one transaction.
    pub async fn create(&self, kind: AmenityKind, proposal: BookingProposal) -> Result<BookingRecord, EngineError> {
        let span = validate_span(proposal.start, proposal.end)?;
        let date = validate_day(proposal.date, span)?;
        validate_occupants(&proposal.occupants)?;
        validate_owner(&proposal.owner)?;
        let status = proposal.status.unwrap_or_else(|| DEFAULT_STATUS.to_string());
        validate_status(&status)?;

        let resource = self
            .catalog
            .find_resource(proposal.resource_id)
            .await?
            .filter(|r| r.kind == kind)
            .ok_or(EngineError::ResourceNotFound(proposal.resource_id))?;

        let new = NewBooking {
            kind,
            resource_id: resource.id,
            resource_label: resource.label,
            floor_id: resource.floor_id,
            date,
            span,
            occupants: proposal.occupants,
            owner: proposal.owner,
            status,
        };
        let record = count_conflict(kind, self.insert_with_ledger(new).await)?;

        metrics::counter!(BOOKINGS_CREATED_TOTAL, "amenity" => kind.as_str()).increment(1);
        info!(
            "{kind} booking {} on {} [{}, {})",
            record.booking.id, record.booking.resource_label, span.start, span.end
        );
        self.notify.send(&BookingEvent::Created(record.booking.clone()));
        Ok(record)
    }

    async fn insert_with_ledger(&self, new: NewBooking) -> Result<BookingRecord, EngineError> {
        let mut tx = self.store.begin().await?;
        let existing = tx.bookings_overlapping(new.kind, new.resource_id, new.span).await?;
        if let Some(conflict) = first_overlap(&existing, new.span, None) {
            return Err(EngineError::SlotAlreadyBooked {
                conflicting: Some(conflict.id),
            });
        }
        let booking = tx.insert_booking(new).await?;
        let ledger = tx.insert_ledger_entry(ledger::entry_for(&booking)).await?;
        tx.commit().await?;
        Ok(BookingRecord { booking, ledger })
    }

    /// Apply a partial update to a booking and refresh its ledger entry.
    pub async fn update(&self, kind: AmenityKind, id: Ulid, patch: BookingPatch) -> Result<BookingRecord, EngineError> {
        if let Some(occupants) = &patch.occupants {
            validate_occupants(occupants)?;
        }
        if let Some(status) = &patch.status {
            validate_status(status)?;
        }
        if patch.resource_label.as_ref().is_some_and(|l| l.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("resource label too long"));
        }

        let mut tx = self.store.begin().await?;
        let before = tx
            .find_booking(kind, id)
            .await?
            .ok_or(EngineError::BookingNotFound(Lookup::Id(id)))?;
        let mut entry = tx
            .find_ledger_entry(id, kind)
            .await?
            .ok_or(EngineError::LedgerEntryMissing { kind, booking_id: id })?;

        let mut after = before.clone();
        if let Some(resource_id) = patch.resource_id
            && resource_id != before.resource_id
        {
            let resource = self
                .catalog
                .find_resource(resource_id)
                .await?
                .filter(|r| r.kind == kind)
                .ok_or(EngineError::ResourceNotFound(resource_id))?;
            after.resource_id = resource.id;
            after.resource_label = resource.label;
            after.floor_id = resource.floor_id;
        }
        if let Some(label) = patch.resource_label {
            after.resource_label = label;
        }
        if let Some(floor_id) = patch.floor_id {
            after.floor_id = floor_id;
        }
        if let Some(occupants) = patch.occupants {
            after.occupants = occupants;
        }
        if let Some(status) = patch.status {
            after.status = status;
        }

        let span = validate_span(
            patch.start.unwrap_or(before.span.start),
            patch.end.unwrap_or(before.span.end),
        )?;
        // A moved start re-derives the day unless a date came with it.
        let date_hint = match (patch.date, patch.start) {
            (Some(date), _) => Some(date),
            (None, Some(_)) => None,
            (None, None) => Some(before.date),
        };
        after.date = validate_day(date_hint, span)?;
        after.span = span;

        if after == before {
            tx.rollback().await;
            return Ok(BookingRecord { booking: before, ledger: entry });
        }

        if self.config.recheck_overlap_on_update {
            let existing = tx.bookings_overlapping(kind, after.resource_id, span).await?;
            if let Some(conflict) = first_overlap(&existing, span, Some(id)) {
                let err = EngineError::SlotAlreadyBooked {
                    conflicting: Some(conflict.id),
                };
                return count_conflict(kind, Err(err));
            }
        }

        tx.update_booking(&after).await?;
        ledger::refresh(&mut entry, &before, &after);
        tx.update_ledger_entry(&entry).await?;
        tx.commit().await?;

        debug!("updated {kind} booking {id}");
        self.notify.send(&BookingEvent::Updated(after.clone()));
        Ok(BookingRecord {
            booking: after,
            ledger: entry,
        })
    }

    /// Delete a booking and its ledger entry. A missing ledger entry is
    /// logged and otherwise ignored.
    pub async fn remove(&self, kind: AmenityKind, id: Ulid) -> Result<Booking, EngineError> {
        let mut tx = self.store.begin().await?;
        let booking = tx
            .find_booking(kind, id)
            .await?
            .ok_or(EngineError::BookingNotFound(Lookup::Id(id)))?;
        tx.delete_booking(kind, id).await?;
        if !tx.delete_ledger_entry(id, kind).await? {
            warn!("{kind} booking {id} had no ledger entry");
        }
        tx.commit().await?;

        metrics::counter!(BOOKINGS_REMOVED_TOTAL, "amenity" => kind.as_str()).increment(1);
        info!("removed {kind} booking {id}");
        self.notify.send(&BookingEvent::Removed { kind, id });
        Ok(booking)
    }

    /// Cancel by ledger id: removes the entry and whichever booking it
    /// projects. An entry whose booking is already gone is still removed.
    pub async fn cancel_entry(&self, ledger_id: Ulid) -> Result<LedgerEntry, EngineError> {
        let entry = self
            .store
            .find_ledger_by_id(ledger_id)
            .await?
            .ok_or(EngineError::BookingNotFound(Lookup::Ledger(ledger_id)))?;
        let (kind, booking_id) = (entry.kind, entry.booking_id);

        let mut tx = self.store.begin().await?;
        let booking_removed = tx.delete_booking(kind, booking_id).await?;
        let entry_removed = tx.delete_ledger_entry(booking_id, kind).await?;
        if !booking_removed && !entry_removed {
            // Lost a race with another cancellation.
            return Err(EngineError::BookingNotFound(Lookup::Ledger(ledger_id)));
        }
        tx.commit().await?;

        if booking_removed {
            metrics::counter!(BOOKINGS_REMOVED_TOTAL, "amenity" => kind.as_str()).increment(1);
            self.notify.send(&BookingEvent::Removed { kind, id: booking_id });
        } else {
            warn!("ledger entry {ledger_id} pointed at missing {kind} booking {booking_id}");
        }
        info!("cancelled ledger entry {ledger_id}");
        Ok(entry)
    }
}
