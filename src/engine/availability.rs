use ulid::Ulid;

use crate::model::*;

// ── Interval algebra ─────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Sort and merge an unordered list of spans.
pub fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// True if `span` intersects any interval of a sorted, disjoint list.
pub fn overlaps_any(disjoint: &[Span], span: &Span) -> bool {
    let idx = disjoint.partition_point(|s| s.end <= span.start);
    disjoint.get(idx).is_some_and(|s| s.start < span.end)
}

/// True if `span` sits entirely inside one interval of a sorted, disjoint list.
pub fn contained_in_any(disjoint: &[Span], span: &Span) -> bool {
    let idx = disjoint.partition_point(|s| s.end <= span.start);
    disjoint.get(idx).is_some_and(|s| s.contains_span(span))
}

// ── Occupancy ────────────────────────────────────────────────────

/// First hold or booking that is active at `now` and overlaps `span`.
/// `ignore` skips one interval id (the booking being moved, or the hold being confirmed).
pub fn first_occupant<'a>(
    ps: &'a ProviderState,
    span: &Span,
    now: Ms,
    ignore: Option<Ulid>,
) -> Option<&'a Interval> {
    ps.overlapping(span)
        .filter(|i| Some(i.id) != ignore)
        .find(|i| i.is_active_at(now))
}

/// Calendar events that block availability and overlap `span`.
pub fn blackouts<'a>(
    ps: &'a ProviderState,
    span: &'a Span,
) -> impl Iterator<Item = &'a CalendarEvent> + 'a {
    ps.events
        .iter()
        .filter(move |e| e.affects_availability && e.span().overlaps(span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

    const H: Ms = HOUR;
    const M: Ms = MINUTE;

    fn provider_with(intervals: Vec<Interval>) -> ProviderState {
        let mut ps = ProviderState::new(Ulid::new(), "p".into(), Tz::UTC, 0, 15 * M);
        for i in intervals {
            ps.insert_interval(i);
        }
        ps
    }

    fn booking(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: IntervalKind::Booking,
        }
    }

    fn hold(start: Ms, end: Ms, expires_at: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: IntervalKind::Hold { expires_at },
        }
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 300)]);
    }

    #[test]
    fn normalize_sorts_first() {
        let spans = vec![Span::new(500, 600), Span::new(100, 300), Span::new(250, 400)];
        assert_eq!(
            normalize(spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    // ── overlaps_any / contained_in_any ──────────────────

    #[test]
    fn overlaps_any_respects_half_open_bounds() {
        let list = vec![Span::new(100, 200), Span::new(400, 500)];
        assert!(overlaps_any(&list, &Span::new(150, 160)));
        assert!(overlaps_any(&list, &Span::new(350, 401)));
        assert!(!overlaps_any(&list, &Span::new(200, 400)));
        assert!(!overlaps_any(&list, &Span::new(500, 600)));
        assert!(!overlaps_any(&[], &Span::new(0, 1)));
    }

    #[test]
    fn contained_in_any_requires_single_window() {
        let list = vec![Span::new(9 * H, 12 * H), Span::new(13 * H, 17 * H)];
        assert!(contained_in_any(&list, &Span::new(9 * H, 12 * H)));
        assert!(contained_in_any(&list, &Span::new(14 * H, 15 * H)));
        // straddles the lunch gap
        assert!(!contained_in_any(&list, &Span::new(11 * H, 14 * H)));
        assert!(!contained_in_any(&list, &Span::new(8 * H, 10 * H)));
    }

    // ── occupancy ────────────────────────────────────────

    #[test]
    fn expired_hold_is_not_an_occupant() {
        let ps = provider_with(vec![hold(9 * H, 10 * H, 1)]);
        assert!(first_occupant(&ps, &Span::new(9 * H, 10 * H), 1000, None).is_none());
        assert!(first_occupant(&ps, &Span::new(9 * H, 10 * H), 0, None).is_some());
    }

    #[test]
    fn ignored_interval_is_skipped() {
        let b = booking(10 * H, 10 * H + 30 * M);
        let id = b.id;
        let ps = provider_with(vec![b]);
        let span = Span::new(10 * H, 11 * H);
        assert_eq!(first_occupant(&ps, &span, 0, None).map(|i| i.id), Some(id));
        assert!(first_occupant(&ps, &span, 0, Some(id)).is_none());
    }

    #[test]
    fn only_blocking_events_are_blackouts() {
        let mut ps = provider_with(vec![]);
        for (affects, title) in [(true, "vacation"), (false, "team lunch")] {
            ps.events.push(CalendarEvent {
                id: Ulid::new(),
                provider_id: ps.id,
                title: title.into(),
                kind: CalendarEventKind::Vacation,
                start: 0,
                end: DAY,
                affects_availability: affects,
            });
        }
        let span = Span::new(H, 2 * H);
        let hits: Vec<_> = blackouts(&ps, &span).map(|e| e.title.as_str()).collect();
        assert_eq!(hits, vec!["vacation"]);
    }
}
