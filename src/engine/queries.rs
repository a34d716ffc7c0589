use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability;
use super::conflict::{today, validate_span};
use super::{Engine, EngineError, Lookup};

impl Engine {
    pub async fn find_one(&self, kind: AmenityKind, id: Ulid) -> Result<Booking, EngineError> {
        self.store
            .find_booking(kind, id)
            .await?
            .ok_or(EngineError::BookingNotFound(Lookup::Id(id)))
    }

    pub async fn find_all(&self, kind: AmenityKind) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.all_bookings(kind).await?)
    }

    /// Upcoming bookings the token created or is listed in (by the
    /// token's email). An empty answer is `BookingNotFound`.
    pub async fn find_by_owner(&self, kind: AmenityKind, token: &str) -> Result<Vec<Booking>, EngineError> {
        self.find_by_owner_from(kind, token, today()).await
    }

    pub(crate) async fn find_by_owner_from(
        &self,
        kind: AmenityKind,
        token: &str,
        from: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        let email = self.directory.resolve_email(token).await?;
        let mine: Vec<Booking> = self
            .store
            .bookings_from(kind, from)
            .await?
            .into_iter()
            .filter(|b| {
                b.owner == token || email.as_ref().is_some_and(|e| b.occupants.iter().any(|o| o == e))
            })
            .collect();
        if mine.is_empty() {
            return Err(EngineError::BookingNotFound(Lookup::Owner(token.to_string())));
        }
        Ok(mine)
    }

    /// Every upcoming ledger entry owned by `token`, across amenity kinds.
    pub async fn ledger_for_owner(&self, token: &str) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(self.store.ledger_for_owner(token, today()).await?)
    }

    /// Units of `kind` not occupied at `now`.
    pub async fn count_free(&self, kind: AmenityKind, now: Ms) -> Result<usize, EngineError> {
        let total = self.catalog.count_resources(kind).await?;
        // Not Span::new: `now` is unvalidated and may be i64::MAX.
        let instant = Span {
            start: now,
            end: now.saturating_add(1),
        };
        let covering = self.store.bookings_overlapping(kind, None, None, instant).await?;
        Ok(availability::count_free(total, &covering, now))
    }

    /// Resources of `kind` with enough capacity and no booking on
    /// `query.date` overlapping the query window.
    pub async fn list_free(&self, kind: AmenityKind, query: AvailabilityQuery) -> Result<Vec<Resource>, EngineError> {
        let span = validate_span(query.start, query.end)?;
        let busy = self
            .store
            .bookings_overlapping(kind, None, Some(query.date), span)
            .await?;
        let candidates = self
            .catalog
            .resources_by_min_capacity(kind, query.min_capacity)
            .await?;
        Ok(availability::free_resources(candidates, &busy))
    }
}
