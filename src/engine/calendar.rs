use chrono::{
    DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta,
    TimeZone,
};
use chrono_tz::Tz;

use crate::model::*;

use super::availability::normalize;

/// Working hours of one provider on one local date, in absolute time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySchedule {
    pub date: NaiveDate,
    /// Sorted, disjoint.
    pub windows: Vec<Span>,
    /// Sorted, disjoint.
    pub breaks: Vec<Span>,
    pub closed_by_override: bool,
    pub reason: Option<String>,
}

impl DaySchedule {
    pub fn is_open(&self) -> bool {
        !self.windows.is_empty()
    }
}

/// Sunday = 0.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Resolve a wall-clock time to an instant. Times inside a spring-forward gap
/// move forward by the gap; ambiguous times take the earliest instant.
pub fn local_to_ms(tz: Tz, date: NaiveDate, time: NaiveTime) -> Ms {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(a, b) => a.timestamp_millis().min(b.timestamp_millis()),
        LocalResult::None => {
            let before = tz
                .offset_from_utc_datetime(&(naive - TimeDelta::hours(24)))
                .fix()
                .local_minus_utc();
            (naive - TimeDelta::seconds(before as i64))
                .and_utc()
                .timestamp_millis()
        }
    }
}

pub fn local_datetime(tz: Tz, ms: Ms) -> NaiveDateTime {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .with_timezone(&tz)
        .naive_local()
}

pub fn local_date(tz: Tz, ms: Ms) -> NaiveDate {
    local_datetime(tz, ms).date()
}

pub fn parse_tz(name: &str) -> Option<Tz> {
    name.parse().ok()
}

fn range_span(tz: Tz, date: NaiveDate, range: &TimeRange) -> Option<Span> {
    let start = local_to_ms(tz, date, range.start);
    let end = local_to_ms(tz, date, range.end);
    (start < end).then(|| Span::new(start, end))
}

/// Project rules and overrides onto one date. An override replaces the weekly
/// rules for its date: closed, custom hours, or (available without hours) unchanged.
pub fn resolve_day(ps: &ProviderState, date: NaiveDate) -> DaySchedule {
    let mut day = DaySchedule {
        date,
        windows: Vec::new(),
        breaks: Vec::new(),
        closed_by_override: false,
        reason: None,
    };

    if let Some(ov) = ps.overrides.get(&date) {
        day.reason = ov.reason.clone();
        if !ov.is_available {
            day.closed_by_override = true;
            return day;
        }
        if let Some(hours) = &ov.custom_hours {
            day.windows = normalize(
                hours
                    .iter()
                    .filter_map(|h| range_span(ps.tz, date, h))
                    .collect(),
            );
            return day;
        }
    }

    let dow = weekday_index(date);
    let mut windows = Vec::new();
    let mut breaks = Vec::new();
    for rule in ps.rules.iter().filter(|r| r.applies_on(date, dow)) {
        let tz = parse_tz(&rule.timezone).unwrap_or(ps.tz);
        windows.extend(range_span(tz, date, &rule.hours()));
        breaks.extend(rule.breaks.iter().filter_map(|b| range_span(tz, date, b)));
    }
    day.windows = normalize(windows);
    day.breaks = normalize(breaks);
    day
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn utc_ms(date: NaiveDate, h: u32, m: u32) -> Ms {
        date.and_time(t(h, m)).and_utc().timestamp_millis()
    }

    fn monday_rule(provider_id: Ulid, tz: &str) -> AvailabilityRule {
        AvailabilityRule {
            id: Ulid::new(),
            provider_id,
            day_of_week: 1,
            start_time: t(9, 0),
            end_time: t(17, 0),
            is_active: true,
            effective_from: d(2024, 1, 1),
            effective_to: None,
            timezone: tz.into(),
            breaks: vec![TimeRange::new(t(12, 0), t(13, 0))],
        }
    }

    fn provider(tz: Tz) -> ProviderState {
        ProviderState::new(Ulid::new(), "p".into(), tz, 0, 15 * MINUTE)
    }

    #[test]
    fn weekday_counts_from_sunday() {
        assert_eq!(weekday_index(d(2024, 1, 7)), 0); // Sunday
        assert_eq!(weekday_index(d(2024, 1, 1)), 1); // Monday
        assert_eq!(weekday_index(d(2024, 1, 6)), 6); // Saturday
    }

    #[test]
    fn spring_forward_gap_shifts_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 02:30 does not exist on 2024-03-10; 03:30 EDT is 07:30 UTC.
        let ms = local_to_ms(tz, d(2024, 3, 10), t(2, 30));
        assert_eq!(ms, utc_ms(d(2024, 3, 10), 7, 30));
    }

    #[test]
    fn fall_back_takes_earliest() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 01:30 happens twice on 2024-11-03; the EDT one is 05:30 UTC.
        let ms = local_to_ms(tz, d(2024, 11, 3), t(1, 30));
        assert_eq!(ms, utc_ms(d(2024, 11, 3), 5, 30));
    }

    #[test]
    fn local_date_uses_provider_zone() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        // 20:00 UTC on Jan 1 is already Jan 2 in Tokyo.
        assert_eq!(local_date(tz, utc_ms(d(2024, 1, 1), 20, 0)), d(2024, 1, 2));
    }

    #[test]
    fn weekly_rule_with_break() {
        let mut ps = provider(Tz::UTC);
        ps.rules.push(monday_rule(ps.id, "UTC"));
        let monday = d(2024, 1, 8);
        let day = resolve_day(&ps, monday);
        assert_eq!(
            day.windows,
            vec![Span::new(utc_ms(monday, 9, 0), utc_ms(monday, 17, 0))]
        );
        assert_eq!(
            day.breaks,
            vec![Span::new(utc_ms(monday, 12, 0), utc_ms(monday, 13, 0))]
        );
        assert!(!resolve_day(&ps, d(2024, 1, 9)).is_open());
    }

    #[test]
    fn rule_respects_effective_range_and_active_flag() {
        let mut ps = provider(Tz::UTC);
        let mut rule = monday_rule(ps.id, "UTC");
        rule.effective_from = d(2024, 1, 8);
        rule.effective_to = Some(d(2024, 1, 15));
        ps.rules.push(rule);
        assert!(!resolve_day(&ps, d(2024, 1, 1)).is_open());
        assert!(resolve_day(&ps, d(2024, 1, 8)).is_open());
        assert!(resolve_day(&ps, d(2024, 1, 15)).is_open());
        assert!(!resolve_day(&ps, d(2024, 1, 22)).is_open());

        ps.rules[0].is_active = false;
        assert!(!resolve_day(&ps, d(2024, 1, 8)).is_open());
    }

    #[test]
    fn rule_hours_read_in_rule_zone() {
        let mut ps = provider(Tz::UTC);
        ps.rules.push(monday_rule(ps.id, "Europe/Paris"));
        let monday = d(2024, 1, 8);
        let day = resolve_day(&ps, monday);
        // 09:00 CET is 08:00 UTC in winter.
        assert_eq!(day.windows[0].start, utc_ms(monday, 8, 0));
    }

    #[test]
    fn closing_override_wins() {
        let mut ps = provider(Tz::UTC);
        ps.rules.push(monday_rule(ps.id, "UTC"));
        let monday = d(2024, 1, 8);
        ps.overrides.insert(
            monday,
            AvailabilityOverride {
                provider_id: ps.id,
                date: monday,
                is_available: false,
                custom_hours: None,
                reason: Some("training".into()),
            },
        );
        let day = resolve_day(&ps, monday);
        assert!(day.closed_by_override);
        assert!(!day.is_open());
        assert_eq!(day.reason.as_deref(), Some("training"));
    }

    #[test]
    fn custom_hours_replace_rule_and_breaks() {
        let mut ps = provider(Tz::UTC);
        ps.rules.push(monday_rule(ps.id, "UTC"));
        let monday = d(2024, 1, 8);
        ps.overrides.insert(
            monday,
            AvailabilityOverride {
                provider_id: ps.id,
                date: monday,
                is_available: true,
                custom_hours: Some(vec![
                    TimeRange::new(t(14, 0), t(16, 0)),
                    TimeRange::new(t(10, 0), t(11, 0)),
                ]),
                reason: None,
            },
        );
        let day = resolve_day(&ps, monday);
        assert_eq!(
            day.windows,
            vec![
                Span::new(utc_ms(monday, 10, 0), utc_ms(monday, 11, 0)),
                Span::new(utc_ms(monday, 14, 0), utc_ms(monday, 16, 0)),
            ]
        );
        assert!(day.breaks.is_empty());
    }

    #[test]
    fn open_override_without_hours_keeps_rule() {
        let mut ps = provider(Tz::UTC);
        ps.rules.push(monday_rule(ps.id, "UTC"));
        let monday = d(2024, 1, 8);
        ps.overrides.insert(
            monday,
            AvailabilityOverride {
                provider_id: ps.id,
                date: monday,
                is_available: true,
                custom_hours: None,
                reason: None,
            },
        );
        assert_eq!(resolve_day(&ps, monday).windows.len(), 1);
    }
}
