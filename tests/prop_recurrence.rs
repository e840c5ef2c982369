use chrono::{Datelike, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use proptest::prelude::*;
use ulid::Ulid;

use slotd::engine::{BookingWindow, ConflictCheck, SlotSpec, detect, expand, occurrences, slots};
use slotd::limits::MAX_SERIES_OCCURRENCES;
use slotd::model::*;

fn weekday(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

fn kind() -> impl Strategy<Value = RecurrenceKind> {
    prop_oneof![
        Just(RecurrenceKind::Daily),
        Just(RecurrenceKind::Weekly),
        Just(RecurrenceKind::Biweekly),
        Just(RecurrenceKind::Monthly),
        Just(RecurrenceKind::Custom),
    ]
}

fn start_date() -> impl Strategy<Value = NaiveDate> {
    (2024i32..2027, 1u32..=12, 1u32..=28).prop_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn config() -> impl Strategy<Value = RecurrenceConfig> {
    (
        kind(),
        1u32..=8,
        prop::collection::btree_set(0u8..7, 1..4),
        prop::option::of(1u32..=104),
        prop::option::of(0i64..400),
    )
        .prop_filter("needs an end", |(_, _, _, max, end)| {
            max.is_some() || end.is_some()
        })
        .prop_map(|(kind, interval, days, max_occurrences, end_offset)| {
            let days: Vec<u8> = days.into_iter().collect();
            RecurrenceConfig {
                kind,
                interval,
                // Custom requires weekdays; the others get them half of the time
                days_of_week: match kind {
                    RecurrenceKind::Custom => Some(days),
                    _ if end_offset.is_some_and(|o| o % 2 == 0) => Some(days),
                    _ => None,
                },
                end_date: end_offset.map(|o| {
                    NaiveDate::from_ymd_opt(2027, 1, 1).unwrap() + chrono::Duration::days(o)
                }),
                max_occurrences,
            }
        })
}

proptest! {
    #[test]
    fn occurrences_are_ordered_and_bounded(first in start_date(), cfg in config()) {
        let dates: Vec<NaiveDate> = occurrences(first, &cfg).take(500).collect();

        prop_assert!(dates.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(dates.iter().all(|d| *d >= first));
        if let Some(max) = cfg.max_occurrences {
            prop_assert!(dates.len() <= max as usize);
        }
        if let Some(end) = cfg.end_date {
            prop_assert!(dates.iter().all(|d| *d <= end));
        }
    }

    #[test]
    fn weekday_filter_is_respected(first in start_date(), cfg in config()) {
        prop_assume!(cfg.kind != RecurrenceKind::Monthly);
        let allowed = match &cfg.days_of_week {
            Some(days) => days.clone(),
            None if cfg.kind == RecurrenceKind::Daily => return Ok(()),
            None => vec![weekday(first)],
        };
        for date in occurrences(first, &cfg).take(200) {
            prop_assert!(allowed.contains(&weekday(date)), "{date} not in {allowed:?}");
        }
    }

    #[test]
    fn monthly_keeps_day_of_month(first in start_date(), interval in 1u32..=3, count in 1u32..=12) {
        let cfg = RecurrenceConfig {
            kind: RecurrenceKind::Monthly,
            interval,
            days_of_week: None,
            end_date: None,
            max_occurrences: Some(count),
        };
        let dates: Vec<NaiveDate> = occurrences(first, &cfg).collect();
        prop_assert_eq!(dates.len(), count as usize);
        for date in dates {
            prop_assert_eq!(date.day(), first.day());
        }
    }

    #[test]
    fn daily_yields_exactly_max(first in start_date(), interval in 1u32..=7, count in 1u32..=104) {
        let cfg = RecurrenceConfig {
            kind: RecurrenceKind::Daily,
            interval,
            days_of_week: None,
            end_date: None,
            max_occurrences: Some(count),
        };
        let dates: Vec<NaiveDate> = occurrences(first, &cfg).collect();
        prop_assert_eq!(dates.len(), count as usize);
        for pair in dates.windows(2) {
            prop_assert_eq!((pair[1] - pair[0]).num_days(), interval as i64);
        }
    }

    #[test]
    fn expansion_never_exceeds_cap(first in start_date(), cfg in config(), hour in 6u32..20) {
        let start = first.and_hms_opt(hour, 0, 0).unwrap().and_utc().timestamp_millis();
        if let Ok(expansion) = expand(start, Tz::UTC, &cfg) {
            prop_assert!(!expansion.starts.is_empty());
            prop_assert!(expansion.starts.len() <= MAX_SERIES_OCCURRENCES);
            // Every occurrence keeps the wall-clock time of the first
            prop_assert!(expansion.starts.iter().all(|s| (s - start).rem_euclid(HOUR) == 0));
            if expansion.truncated {
                prop_assert_eq!(expansion.starts.len(), MAX_SERIES_OCCURRENCES);
            }
        }
    }
}

// ── Slot projection ──────────────────────────────────────

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
}

fn provider_with_bookings(starts: &[u32], duration_minutes: u32) -> ProviderState {
    let id = Ulid::new();
    let mut ps = ProviderState::new(id, "prop".into(), Tz::UTC, 0, 15 * MINUTE);
    ps.rules.push(AvailabilityRule {
        id: Ulid::new(),
        provider_id: id,
        day_of_week: 1,
        start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        is_active: true,
        effective_from: NaiveDate::from_ymd_opt(2029, 1, 1).unwrap(),
        effective_to: None,
        timezone: "UTC".into(),
        breaks: vec![TimeRange::new(
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
        )],
    });
    let nine = monday().and_hms_opt(9, 0, 0).unwrap().and_utc().timestamp_millis();
    for quarter in starts {
        ps.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::from_minutes(nine + *quarter as Ms * 15 * MINUTE, duration_minutes),
            kind: IntervalKind::Booking,
        });
    }
    ps
}

fn open_window() -> BookingWindow {
    BookingWindow {
        earliest: i64::MIN / 2,
        latest: i64::MAX / 2,
    }
}

proptest! {
    #[test]
    fn available_slots_never_overlap_bookings(
        starts in prop::collection::vec(0u32..32, 0..8),
        booking_minutes in prop::sample::select(vec![15u32, 30, 45, 60]),
        slot_minutes in prop::sample::select(vec![15u32, 30, 60, 90]),
    ) {
        let ps = provider_with_bookings(&starts, booking_minutes);
        let spec = SlotSpec {
            date_from: monday(),
            date_to: monday(),
            service_id: None,
            duration: slot_minutes as Ms * MINUTE,
            price_cents: None,
            include_blocked: false,
            now: 0,
            window: open_window(),
        };
        for slot in slots(&ps, spec).filter(|s| s.is_available) {
            let span = Span::new(slot.start, slot.end);
            prop_assert!(ps.intervals.iter().all(|i| !i.span.overlaps(&span)));
            // Agrees with the conflict detector
            let check = ConflictCheck {
                span,
                now: 0,
                window: open_window(),
                ignore: None,
                pending: &[],
            };
            prop_assert!(detect(&ps, &check).is_empty(), "slot {:?} has conflicts", span);
        }
    }
}
