use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::Span;

use super::EngineError;

/// An occupying reservation's interval, as handed to the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub reservation_id: Ulid,
    pub span: Span,
}

pub(crate) fn validate_interval(start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    Ok(())
}

/// Validated candidate span for `[start, end)` on `date`.
pub(crate) fn candidate_span(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Result<Span, EngineError> {
    validate_interval(start, end)?;
    Ok(Span::on_date(date, start, end))
}

/// First occupying slot that intersects `candidate`. Slots that only touch
/// at an endpoint do not conflict.
pub(crate) fn find_conflict(occupying: &[Slot], candidate: &Span) -> Option<Ulid> {
    occupying
        .iter()
        .find(|slot| slot.span.start < candidate.end && slot.span.end > candidate.start)
        .map(|slot| slot.reservation_id)
}
