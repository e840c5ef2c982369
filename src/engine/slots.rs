use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{blackouts, first_occupant, overlaps_any};
use super::calendar::resolve_day;
use super::conflict::BookingWindow;

/// Parameters of one slot projection.
#[derive(Debug, Clone, Copy)]
pub struct SlotSpec {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub service_id: Option<Ulid>,
    pub duration: Ms,
    pub price_cents: Option<Cents>,
    pub include_blocked: bool,
    pub now: Ms,
    pub window: BookingWindow,
}

#[derive(Debug, Clone)]
struct DayCursor {
    windows: Vec<Span>,
    breaks: Vec<Span>,
    window_idx: usize,
    next_start: Ms,
}

/// Lazy, finite projection of a provider's calendar into candidate slots.
/// Clone before consuming to replay the same sequence.
#[derive(Debug, Clone)]
pub struct Slots<'a> {
    ps: &'a ProviderState,
    spec: SlotSpec,
    next_date: Option<NaiveDate>,
    day: Option<DayCursor>,
}

pub fn slots(ps: &ProviderState, spec: SlotSpec) -> Slots<'_> {
    Slots {
        ps,
        spec,
        next_date: Some(spec.date_from),
        day: None,
    }
}

impl Slots<'_> {
    fn load_next_day(&mut self) -> bool {
        let Some(date) = self.next_date.filter(|d| *d <= self.spec.date_to) else {
            return false;
        };
        self.next_date = date.succ_opt();
        let day = resolve_day(self.ps, date);
        let next_start = day.windows.first().map_or(0, |w| w.start);
        self.day = Some(DayCursor {
            windows: day.windows,
            breaks: day.breaks,
            window_idx: 0,
            next_start,
        });
        true
    }
}

fn build(ps: &ProviderState, spec: &SlotSpec, span: Span, breaks: &[Span]) -> Option<TimeSlot> {
    if span.start < spec.window.earliest || span.start > spec.window.latest {
        return None;
    }

    let block_reason = if overlaps_any(breaks, &span) {
        Some("break".to_string())
    } else {
        blackouts(ps, &span).next().map(|e| e.title.clone())
    };
    if block_reason.is_some() && !spec.include_blocked {
        return None;
    }

    let padded = span.padded(ps.buffer);
    let occupant = first_occupant(ps, &padded, spec.now, None);
    let booking_id = first_occupant(ps, &span, spec.now, None)
        .filter(|i| i.kind == IntervalKind::Booking)
        .map(|i| i.id);

    Some(TimeSlot {
        id: time_slot_id(ps.id, span.start),
        provider_id: ps.id,
        service_id: spec.service_id,
        start: span.start,
        end: span.end,
        duration_minutes: (spec.duration / MINUTE) as u32,
        is_available: block_reason.is_none() && occupant.is_none(),
        is_blocked: block_reason.is_some(),
        block_reason,
        booking_id,
        price_cents: spec.price_cents,
    })
}

impl Iterator for Slots<'_> {
    type Item = TimeSlot;

    fn next(&mut self) -> Option<TimeSlot> {
        let step = self.ps.slot_step.max(MINUTE);
        loop {
            let Some(day) = self.day.as_mut() else {
                if !self.load_next_day() {
                    return None;
                }
                continue;
            };
            let Some(window) = day.windows.get(day.window_idx).copied() else {
                self.day = None;
                continue;
            };
            let start = day.next_start.max(window.start);
            if start + self.spec.duration > window.end {
                day.window_idx += 1;
                if let Some(next) = day.windows.get(day.window_idx) {
                    day.next_start = next.start;
                }
                continue;
            }
            day.next_start = start + step;
            let span = Span::new(start, start + self.spec.duration);
            if let Some(slot) = build(self.ps, &self.spec, span, &day.breaks) {
                return Some(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use chrono_tz::Tz;

    const M: Ms = MINUTE;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> Ms {
        date.and_time(t(h, m)).and_utc().timestamp_millis()
    }

    fn provider(start: (u32, u32), end: (u32, u32), breaks: Vec<TimeRange>) -> ProviderState {
        let mut ps = ProviderState::new(Ulid::new(), "p".into(), Tz::UTC, 0, 30 * M);
        ps.rules.push(AvailabilityRule {
            id: Ulid::new(),
            provider_id: ps.id,
            day_of_week: 1,
            start_time: t(start.0, start.1),
            end_time: t(end.0, end.1),
            is_active: true,
            effective_from: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            effective_to: None,
            timezone: "UTC".into(),
            breaks,
        });
        ps
    }

    fn spec(duration: Ms) -> SlotSpec {
        let now = at(monday(), 0, 0) - DAY;
        SlotSpec {
            date_from: monday(),
            date_to: monday(),
            service_id: None,
            duration,
            price_cents: None,
            include_blocked: false,
            now,
            window: BookingWindow {
                earliest: now,
                latest: now + 100 * DAY,
            },
        }
    }

    #[test]
    fn steps_through_window() {
        let ps = provider((9, 0), (11, 0), vec![]);
        let starts: Vec<Ms> = slots(&ps, spec(30 * M)).map(|s| s.start).collect();
        assert_eq!(
            starts,
            vec![
                at(monday(), 9, 0),
                at(monday(), 9, 30),
                at(monday(), 10, 0),
                at(monday(), 10, 30),
            ]
        );
    }

    #[test]
    fn long_service_fits_inside_window() {
        let ps = provider((9, 0), (11, 0), vec![]);
        let all: Vec<_> = slots(&ps, spec(90 * M)).collect();
        assert_eq!(all.len(), 2); // 09:00 and 09:30
        assert!(all.iter().all(|s| s.end <= at(monday(), 11, 0)));
    }

    #[test]
    fn breaks_are_omitted_or_flagged() {
        let lunch = vec![TimeRange::new(t(10, 0), t(10, 30))];
        let ps = provider((9, 0), (11, 0), lunch);

        let omitted: Vec<Ms> = slots(&ps, spec(30 * M)).map(|s| s.start).collect();
        assert!(!omitted.contains(&at(monday(), 10, 0)));
        assert_eq!(omitted.len(), 3);

        let flagged: Vec<_> = slots(
            &ps,
            SlotSpec {
                include_blocked: true,
                ..spec(30 * M)
            },
        )
        .collect();
        assert_eq!(flagged.len(), 4);
        let blocked = flagged.iter().find(|s| s.is_blocked).unwrap();
        assert_eq!(blocked.start, at(monday(), 10, 0));
        assert_eq!(blocked.block_reason.as_deref(), Some("break"));
        assert!(!blocked.is_available);
    }

    #[test]
    fn booked_slot_is_unavailable_with_id() {
        let mut ps = provider((9, 0), (11, 0), vec![]);
        let id = Ulid::new();
        ps.insert_interval(Interval {
            id,
            span: Span::new(at(monday(), 9, 30), at(monday(), 10, 0)),
            kind: IntervalKind::Booking,
        });
        let all: Vec<_> = slots(&ps, spec(30 * M)).collect();
        let taken = all.iter().find(|s| s.start == at(monday(), 9, 30)).unwrap();
        assert!(!taken.is_available);
        assert_eq!(taken.booking_id, Some(id));
        assert!(all.iter().filter(|s| s.is_available).count() == 3);
    }

    #[test]
    fn buffer_shadows_neighbors() {
        let mut ps = provider((9, 0), (11, 0), vec![]);
        ps.buffer = 15 * M;
        ps.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(at(monday(), 9, 30), at(monday(), 10, 0)),
            kind: IntervalKind::Booking,
        });
        let free: Vec<Ms> = slots(&ps, spec(30 * M))
            .filter(|s| s.is_available)
            .map(|s| s.start)
            .collect();
        assert_eq!(free, vec![at(monday(), 10, 30)]);
    }

    #[test]
    fn past_slots_are_skipped() {
        let ps = provider((9, 0), (11, 0), vec![]);
        let now = at(monday(), 10, 0);
        let s = SlotSpec {
            now,
            window: BookingWindow {
                earliest: now,
                latest: now + DAY,
            },
            ..spec(30 * M)
        };
        let starts: Vec<Ms> = slots(&ps, s).map(|s| s.start).collect();
        assert_eq!(starts, vec![at(monday(), 10, 0), at(monday(), 10, 30)]);
    }

    #[test]
    fn clone_replays_same_sequence() {
        let ps = provider((9, 0), (12, 0), vec![]);
        let mut it = slots(&ps, spec(30 * M));
        it.next();
        let replay = it.clone();
        assert_eq!(it.collect::<Vec<_>>(), replay.collect::<Vec<_>>());
    }

    #[test]
    fn multi_day_range_skips_closed_days() {
        let ps = provider((9, 0), (10, 0), vec![]);
        let s = SlotSpec {
            date_to: monday() + chrono::Days::new(7),
            ..spec(30 * M)
        };
        let dates: Vec<NaiveDate> = slots(&ps, s)
            .map(|s| chrono::DateTime::from_timestamp_millis(s.start).unwrap().date_naive())
            .collect();
        assert_eq!(
            dates,
            vec![
                monday(),
                monday(),
                monday() + chrono::Days::new(7),
                monday() + chrono::Days::new(7),
            ]
        );
    }
}
