use chrono::{Days, Months, NaiveDate};
use chrono_tz::Tz;

use crate::limits::{MAX_RECURRENCE_INTERVAL, MAX_SERIES_OCCURRENCES};
use crate::model::*;

use super::EngineError;
use super::calendar::{local_datetime, local_to_ms, weekday_index};

/// Series scan stops this far past the first date even if nothing matched.
const HORIZON_DAYS: u64 = 3 * 366;

pub fn validate_config(cfg: &RecurrenceConfig) -> Result<(), EngineError> {
    if cfg.interval == 0 {
        return Err(EngineError::invalid("recurrence interval must be at least 1"));
    }
    if cfg.interval > MAX_RECURRENCE_INTERVAL {
        return Err(EngineError::LimitExceeded("recurrence interval too large"));
    }
    if cfg.end_date.is_none() && cfg.max_occurrences.is_none() {
        return Err(EngineError::invalid(
            "recurrence needs an end date or a maximum number of occurrences",
        ));
    }
    match cfg.max_occurrences {
        Some(0) => {
            return Err(EngineError::invalid("max_occurrences must be at least 1"));
        }
        Some(n) if n as usize > MAX_SERIES_OCCURRENCES => {
            return Err(EngineError::LimitExceeded("series longer than 104 occurrences"));
        }
        _ => {}
    }
    if let Some(days) = &cfg.days_of_week {
        if days.iter().any(|d| *d > 6) {
            return Err(EngineError::invalid("days_of_week entries must be in 0..=6"));
        }
        if days.is_empty() {
            return Err(EngineError::invalid("days_of_week must not be empty"));
        }
    }
    if cfg.kind == RecurrenceKind::Custom && cfg.days_of_week.is_none() {
        return Err(EngineError::invalid("custom recurrence requires days_of_week"));
    }
    Ok(())
}

/// Occurrence dates of a series, in order, starting from `first`.
#[derive(Debug, Clone)]
pub struct Occurrences {
    first: NaiveDate,
    kind: RecurrenceKind,
    /// Step in days, weeks or months depending on `kind`.
    step: u32,
    days: Vec<u8>,
    end_date: Option<NaiveDate>,
    remaining: Option<u32>,
    /// Index of the next day, week window or month to look at.
    cursor: u32,
    /// Dates left in the current week window, latest first.
    pending: Vec<NaiveDate>,
}

pub fn occurrences(first: NaiveDate, cfg: &RecurrenceConfig) -> Occurrences {
    let mut days = cfg
        .days_of_week
        .clone()
        .unwrap_or_else(|| match cfg.kind {
            RecurrenceKind::Weekly | RecurrenceKind::Biweekly => vec![weekday_index(first)],
            _ => Vec::new(),
        });
    days.sort_unstable();
    days.dedup();
    let step = match cfg.kind {
        RecurrenceKind::Biweekly => cfg.interval.saturating_mul(2),
        _ => cfg.interval,
    };
    Occurrences {
        first,
        kind: cfg.kind,
        step: step.max(1),
        days,
        end_date: cfg.end_date,
        remaining: cfg.max_occurrences,
        cursor: 0,
        pending: Vec::new(),
    }
}

impl Occurrences {
    fn horizon(&self) -> Option<NaiveDate> {
        self.first.checked_add_days(Days::new(HORIZON_DAYS))
    }

    /// Next candidate date before end-date and count limits are applied.
    fn next_candidate(&mut self) -> Option<NaiveDate> {
        let horizon = self.horizon()?;
        loop {
            let date = match self.kind {
                RecurrenceKind::Daily | RecurrenceKind::Custom => {
                    let offset = self.cursor as u64 * self.step as u64;
                    self.cursor += 1;
                    let date = self.first.checked_add_days(Days::new(offset))?;
                    if !self.days.is_empty() && !self.days.contains(&weekday_index(date)) {
                        if date > horizon {
                            return None;
                        }
                        continue;
                    }
                    date
                }
                RecurrenceKind::Weekly | RecurrenceKind::Biweekly => {
                    if self.pending.is_empty() {
                        let week_start = self
                            .first
                            .checked_sub_days(Days::new(weekday_index(self.first) as u64))?;
                        let offset = self.cursor as u64 * self.step as u64 * 7;
                        self.cursor += 1;
                        let base = week_start.checked_add_days(Days::new(offset))?;
                        if base > horizon {
                            return None;
                        }
                        // Reversed so `pop` yields ascending dates.
                        self.pending = self
                            .days
                            .iter()
                            .rev()
                            .filter_map(|d| base.checked_add_days(Days::new(*d as u64)))
                            .filter(|d| *d >= self.first)
                            .collect();
                        continue;
                    }
                    self.pending.pop()?
                }
                RecurrenceKind::Monthly => {
                    let months = self.cursor.checked_mul(self.step)?;
                    self.cursor += 1;
                    // Computed from the first date each time so short months don't drift.
                    self.first.checked_add_months(Months::new(months))?
                }
            };
            if date > horizon {
                return None;
            }
            return Some(date);
        }
    }
}

impl Iterator for Occurrences {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        if self.remaining == Some(0) {
            return None;
        }
        let date = self.next_candidate()?;
        if self.end_date.is_some_and(|end| date > end) {
            self.remaining = Some(0);
            return None;
        }
        if let Some(left) = self.remaining.as_mut() {
            *left -= 1;
        }
        Some(date)
    }
}

/// Occurrence start instants for a series beginning at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub starts: Vec<Ms>,
    /// The end date allowed more occurrences than the series cap.
    pub truncated: bool,
}

/// Expand a series at the wall-clock time of `start` in the provider's zone.
pub fn expand(start: Ms, tz: Tz, cfg: &RecurrenceConfig) -> Result<Expansion, EngineError> {
    validate_config(cfg)?;
    let local = local_datetime(tz, start);
    if cfg.end_date.is_some_and(|end| end < local.date()) {
        return Err(EngineError::invalid("recurrence end date is before the first occurrence"));
    }
    let mut starts: Vec<Ms> = occurrences(local.date(), cfg)
        .take(MAX_SERIES_OCCURRENCES + 1)
        .map(|date| local_to_ms(tz, date, local.time()))
        .collect();
    let truncated = starts.len() > MAX_SERIES_OCCURRENCES;
    starts.truncate(MAX_SERIES_OCCURRENCES);
    if starts.is_empty() {
        return Err(EngineError::invalid("recurrence produces no occurrences"));
    }
    Ok(Expansion { starts, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn cfg(kind: RecurrenceKind, interval: u32) -> RecurrenceConfig {
        RecurrenceConfig {
            kind,
            interval,
            days_of_week: None,
            end_date: None,
            max_occurrences: None,
        }
    }

    #[test]
    fn weekly_mondays_four_times() {
        let c = RecurrenceConfig {
            days_of_week: Some(vec![1]),
            max_occurrences: Some(4),
            ..cfg(RecurrenceKind::Weekly, 1)
        };
        let dates: Vec<_> = occurrences(d(2024, 1, 1), &c).collect();
        assert_eq!(
            dates,
            vec![d(2024, 1, 1), d(2024, 1, 8), d(2024, 1, 15), d(2024, 1, 22)]
        );
    }

    #[test]
    fn weekly_multiple_days_per_window() {
        // Start Wednesday; Monday of the first week is already past.
        let c = RecurrenceConfig {
            days_of_week: Some(vec![5, 1]),
            max_occurrences: Some(4),
            ..cfg(RecurrenceKind::Weekly, 1)
        };
        let dates: Vec<_> = occurrences(d(2024, 1, 3), &c).collect();
        assert_eq!(
            dates,
            vec![d(2024, 1, 5), d(2024, 1, 8), d(2024, 1, 12), d(2024, 1, 15)]
        );
    }

    #[test]
    fn weekly_defaults_to_start_weekday() {
        let c = RecurrenceConfig {
            max_occurrences: Some(2),
            ..cfg(RecurrenceKind::Weekly, 3)
        };
        let dates: Vec<_> = occurrences(d(2024, 1, 3), &c).collect();
        assert_eq!(dates, vec![d(2024, 1, 3), d(2024, 1, 24)]);
    }

    #[test]
    fn biweekly_doubles_the_step() {
        let c = RecurrenceConfig {
            max_occurrences: Some(3),
            ..cfg(RecurrenceKind::Biweekly, 1)
        };
        let dates: Vec<_> = occurrences(d(2024, 1, 1), &c).collect();
        assert_eq!(dates, vec![d(2024, 1, 1), d(2024, 1, 15), d(2024, 1, 29)]);
    }

    #[test]
    fn daily_stops_at_end_date_inclusive() {
        let c = RecurrenceConfig {
            end_date: Some(d(2024, 1, 7)),
            ..cfg(RecurrenceKind::Daily, 3)
        };
        let dates: Vec<_> = occurrences(d(2024, 1, 1), &c).collect();
        assert_eq!(dates, vec![d(2024, 1, 1), d(2024, 1, 4), d(2024, 1, 7)]);
    }

    #[test]
    fn first_limit_wins() {
        let c = RecurrenceConfig {
            end_date: Some(d(2024, 12, 31)),
            max_occurrences: Some(2),
            ..cfg(RecurrenceKind::Daily, 1)
        };
        assert_eq!(occurrences(d(2024, 1, 1), &c).count(), 2);
    }

    #[test]
    fn monthly_clamps_to_month_end() {
        let c = RecurrenceConfig {
            max_occurrences: Some(4),
            ..cfg(RecurrenceKind::Monthly, 1)
        };
        let dates: Vec<_> = occurrences(d(2024, 1, 31), &c).collect();
        assert_eq!(
            dates,
            vec![d(2024, 1, 31), d(2024, 2, 29), d(2024, 3, 31), d(2024, 4, 30)]
        );
    }

    #[test]
    fn custom_filters_by_weekday() {
        let c = RecurrenceConfig {
            days_of_week: Some(vec![2, 4]),
            end_date: Some(d(2024, 1, 14)),
            ..cfg(RecurrenceKind::Custom, 1)
        };
        let dates: Vec<_> = occurrences(d(2024, 1, 1), &c).collect();
        assert_eq!(
            dates,
            vec![d(2024, 1, 2), d(2024, 1, 4), d(2024, 1, 9), d(2024, 1, 11)]
        );
    }

    #[test]
    fn unreachable_weekday_terminates() {
        // Every 7 days from a Monday never lands on a Tuesday.
        let c = RecurrenceConfig {
            days_of_week: Some(vec![2]),
            max_occurrences: Some(3),
            ..cfg(RecurrenceKind::Daily, 7)
        };
        assert_eq!(occurrences(d(2024, 1, 1), &c).count(), 0);
    }

    #[test]
    fn config_validation() {
        assert!(validate_config(&cfg(RecurrenceKind::Daily, 1)).is_err()); // unbounded
        let bounded = RecurrenceConfig {
            max_occurrences: Some(3),
            ..cfg(RecurrenceKind::Daily, 1)
        };
        assert!(validate_config(&bounded).is_ok());
        assert!(validate_config(&RecurrenceConfig { interval: 0, ..bounded.clone() }).is_err());
        assert!(matches!(
            validate_config(&RecurrenceConfig {
                max_occurrences: Some(105),
                ..bounded.clone()
            }),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(validate_config(&RecurrenceConfig {
            kind: RecurrenceKind::Custom,
            ..bounded.clone()
        })
        .is_err());
        assert!(validate_config(&RecurrenceConfig {
            days_of_week: Some(vec![7]),
            ..bounded
        })
        .is_err());
    }

    #[test]
    fn expansion_keeps_wall_clock_across_dst() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 10:00 local on two Mondays around the March 31 2024 switch.
        let first = local_to_ms(tz, d(2024, 3, 25), chrono::NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        let c = RecurrenceConfig {
            max_occurrences: Some(2),
            ..cfg(RecurrenceKind::Weekly, 1)
        };
        let exp = expand(first, tz, &c).unwrap();
        assert_eq!(exp.starts.len(), 2);
        assert_eq!(exp.starts[1] - exp.starts[0], 7 * DAY - HOUR);
        assert!(!exp.truncated);
    }

    #[test]
    fn expansion_caps_long_series() {
        let c = RecurrenceConfig {
            end_date: Some(d(2025, 12, 31)),
            ..cfg(RecurrenceKind::Daily, 1)
        };
        let start = d(2024, 1, 1).and_hms_opt(9, 0, 0).unwrap().and_utc().timestamp_millis();
        let exp = expand(start, Tz::UTC, &c).unwrap();
        assert_eq!(exp.starts.len(), MAX_SERIES_OCCURRENCES);
        assert!(exp.truncated);
    }
}
