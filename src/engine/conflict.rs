use chrono::Days;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;
use super::availability::{blackouts, contained_in_any, first_occupant, overlaps_any};
use super::calendar::{local_datetime, local_to_ms, resolve_day};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("duration longer than 24 hours"));
    }
    Ok(())
}

/// Range of acceptable start instants, derived from notice and advance settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingWindow {
    pub earliest: Ms,
    pub latest: Ms,
}

/// One requested interval and the context it is judged in.
#[derive(Debug, Clone, Copy)]
pub struct ConflictCheck<'a> {
    pub span: Span,
    pub now: Ms,
    pub window: BookingWindow,
    /// Interval that must not count against the request (a booking being moved).
    pub ignore: Option<Ulid>,
    /// Intervals already accepted for the same request (earlier series occurrences).
    pub pending: &'a [Span],
}

/// Evaluate every conflict category in order. At most one conflict is reported per category.
pub fn detect(ps: &ProviderState, check: &ConflictCheck<'_>) -> Vec<BookingConflict> {
    let span = check.span;
    let mut out = Vec::new();

    if span.start < check.window.earliest {
        out.push(BookingConflict::new(
            ConflictKind::OutsideHours,
            "requested start is in the past or inside the minimum notice period",
        ));
    } else if span.start > check.window.latest {
        out.push(BookingConflict::new(
            ConflictKind::OutsideHours,
            "requested start is beyond the advance booking window",
        ));
    }

    let local = local_datetime(ps.tz, span.start);
    let day = resolve_day(ps, local.date());
    if day.closed_by_override {
        let message = match &day.reason {
            Some(reason) => format!("provider is unavailable on {}: {reason}", day.date),
            None => format!("provider is unavailable on {}", day.date),
        };
        out.push(BookingConflict::new(ConflictKind::Unavailable, message));
    } else if !contained_in_any(&day.windows, &span) {
        out.push(BookingConflict::new(
            ConflictKind::BusinessHours,
            "requested time is outside business hours",
        ));
    }

    if overlaps_any(&day.breaks, &span) {
        out.push(BookingConflict::new(
            ConflictKind::BreakTime,
            "requested time overlaps a scheduled break",
        ));
    } else if let Some(event) = blackouts(ps, &span).next() {
        out.push(
            BookingConflict::new(
                ConflictKind::BreakTime,
                format!("requested time overlaps '{}'", event.title),
            )
            .with_conflicting(event.id),
        );
    }

    if let Some(occupant) = first_occupant(ps, &span, check.now, check.ignore) {
        let message = match occupant.kind {
            IntervalKind::Hold { .. } => "interval is held by another reservation",
            IntervalKind::Booking => "interval is already booked",
        };
        out.push(
            BookingConflict::new(ConflictKind::AlreadyBooked, message)
                .with_conflicting(occupant.id),
        );
    } else if check.pending.iter().any(|p| p.overlaps(&span)) {
        out.push(BookingConflict::new(
            ConflictKind::Overlap,
            "occurrence overlaps another occurrence of the same request",
        ));
    } else if ps.buffer > 0 {
        let padded = span.padded(ps.buffer);
        let buffer_minutes = ps.buffer / MINUTE;
        if let Some(neighbor) = first_occupant(ps, &padded, check.now, check.ignore) {
            out.push(
                BookingConflict::new(
                    ConflictKind::BufferViolation,
                    format!("less than {buffer_minutes} minutes from a neighboring appointment"),
                )
                .with_conflicting(neighbor.id),
            );
        } else if check.pending.iter().any(|p| p.overlaps(&padded)) {
            out.push(BookingConflict::new(
                ConflictKind::BufferViolation,
                format!("less than {buffer_minutes} minutes from another occurrence"),
            ));
        }
    }

    out
}

/// Conflicts plus suggested alternatives: one hour earlier and later on the same
/// local day, then the same local time the next day. Only conflict-free candidates survive.
pub fn detect_with_alternatives(
    ps: &ProviderState,
    check: &ConflictCheck<'_>,
) -> Vec<BookingConflict> {
    let mut conflicts = detect(ps, check);
    if conflicts.is_empty() {
        return conflicts;
    }
    let alternatives = suggest_alternatives(ps, check);
    for conflict in &mut conflicts {
        conflict.suggested_alternatives = alternatives.clone();
    }
    conflicts
}

pub fn suggest_alternatives(ps: &ProviderState, check: &ConflictCheck<'_>) -> Vec<Span> {
    let span = check.span;
    let local = local_datetime(ps.tz, span.start);
    let duration = span.duration_ms();

    let mut candidates = Vec::with_capacity(3);
    for shift in [-HOUR, HOUR] {
        let candidate = span.shifted(shift);
        if local_datetime(ps.tz, candidate.start).date() == local.date() {
            candidates.push(candidate);
        }
    }
    if let Some(next_day) = local.date().checked_add_days(Days::new(1)) {
        let start = local_to_ms(ps.tz, next_day, local.time());
        candidates.push(Span::new(start, start + duration));
    }

    candidates
        .into_iter()
        .filter(|candidate| {
            let moved = ConflictCheck {
                span: *candidate,
                ..*check
            };
            detect(ps, &moved).is_empty()
        })
        .collect()
}
