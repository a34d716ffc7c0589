use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Start of the current UTC day.
pub(crate) fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Check `start < end` and the timestamp range, returning the span.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval(format!(
            "end ({end}) must be after start ({start})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

/// Resolve the calendar day of a booking. An explicit `date` must be the
/// UTC day of `span.start`, and the span may not run past that day.
pub(crate) fn validate_day(date: Option<NaiveDate>, span: Span) -> Result<NaiveDate, EngineError> {
    let start_day = day_of(span.start)
        .ok_or_else(|| EngineError::InvalidInterval("start is not a valid instant".into()))?;
    let date = date.unwrap_or(start_day);
    if date != start_day {
        return Err(EngineError::InvalidInterval(format!(
            "date {date} does not match start day {start_day}"
        )));
    }
    if span.end > day_start(date) + DAY_MS {
        return Err(EngineError::InvalidInterval(format!("booking runs past the end of {date}")));
    }
    Ok(date)
}

pub(crate) fn validate_occupants(occupants: &[String]) -> Result<(), EngineError> {
    if occupants.len() > MAX_OCCUPANTS {
        return Err(EngineError::LimitExceeded("too many occupants"));
    }
    if occupants.iter().any(|o| o.len() > MAX_LABEL_LEN) {
        return Err(EngineError::LimitExceeded("occupant too long"));
    }
    Ok(())
}

pub(crate) fn validate_status(status: &str) -> Result<(), EngineError> {
    if status.len() > MAX_STATUS_LEN {
        return Err(EngineError::LimitExceeded("status too long"));
    }
    Ok(())
}

pub(crate) fn validate_owner(owner: &str) -> Result<(), EngineError> {
    if owner.len() > MAX_TOKEN_LEN {
        return Err(EngineError::LimitExceeded("owner token too long"));
    }
    Ok(())
}

/// First existing booking, other than `except`, whose span overlaps `span`.
pub(crate) fn first_overlap(existing: &[Booking], span: Span, except: Option<ulid::Ulid>) -> Option<&Booking> {
    existing
        .iter()
        .find(|b| Some(b.id) != except && b.span.overlaps(&span))
}
