//! Cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds, UTC)
//! Per field: *, */N, N, A-B, A-B/N, A/N and comma-separated lists of those.
//! Day-of-week is 0-7 with both 0 and 7 meaning Sunday.
//! Example: "0 2 * * *" = every day at 02:00.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use complyflow_core::error::{ComplyError, Result};

/// How far ahead to look for a match (covers Feb 29 schedules).
const SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days_of_month: Vec<bool>,
    months: Vec<bool>,
    days_of_week: Vec<bool>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ComplyError::validation(format!(
                "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }

        let field = |idx: usize, name: &str, min: u32, max: u32| {
            parse_field(parts[idx], min, max).map_err(|reason| {
                ComplyError::validation(format!(
                    "invalid cron {name} field '{}' in '{expression}': {reason}",
                    parts[idx]
                ))
            })
        };

        let minutes = field(0, "minute", 0, 59)?;
        let hours = field(1, "hour", 0, 23)?;
        let days_of_month = field(2, "day-of-month", 1, 31)?;
        let months = field(3, "month", 1, 12)?;
        let mut days_of_week = field(4, "day-of-week", 0, 7)?;
        // 7 is an alias for Sunday.
        if days_of_week[7] {
            days_of_week[0] = true;
        }
        days_of_week.truncate(7);

        let schedule = Self {
            expression: expression.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        };
        if !schedule.can_fire() {
            return Err(ComplyError::validation(format!(
                "cron expression '{expression}' never fires (no selected month has the selected days)"
            )));
        }
        Ok(schedule)
    }

    /// Whether some calendar date matches. Every weekday occurs in every
    /// month, so only a day-of-month restriction on its own can rule out all dates.
    fn can_fire(&self) -> bool {
        if self.dow_restricted || !self.dom_restricted {
            return true;
        }
        (1..=12u32).filter(|&m| self.months[m as usize]).any(|m| {
            let longest = match m {
                2 => 29,
                4 | 6 | 9 | 11 => 30,
                _ => 31,
            };
            (1..=longest).any(|d| self.days_of_month[d])
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start + Duration::days(366 * SEARCH_YEARS as i64);
        let mut t = start;

        while t <= limit {
            if !self.months[t.month() as usize] {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = midnight(t.date_naive().succ_opt()?);
                continue;
            }
            if !self.hours[t.hour() as usize] {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes[t.minute() as usize] {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// Classic cron rule: when both day fields are restricted, either may match.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month[t.day() as usize];
        let dow = self.days_of_week[t.weekday().num_days_from_sunday() as usize];
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

/// Compute the next run time for `expression`, or `None` if it is invalid or never fires.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.next_after(after),
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(midnight(NaiveDate::from_ymd_opt(year, month, 1)?))
}

/// Parse a cron field into a lookup table indexed by value (`0..=max`).
fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<Vec<bool>, String> {
    let mut table = vec![false; max as usize + 1];
    for item in field.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err("empty list item".into());
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("bad step '{step}'"))?;
                if step == 0 {
                    return Err("step must be > 0".into());
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let v = parse_value(range, min, max)?;
            // "A/N" runs from A to the end of the range.
            if item.contains('/') { (v, max) } else { (v, v) }
        };
        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed"));
        }
        for v in (lo..=hi).step_by(step as usize) {
            table[v as usize] = true;
        }
    }
    Ok(table)
}

fn parse_value(s: &str, min: u32, max: u32) -> std::result::Result<u32, String> {
    let n: u32 = s.trim().parse().map_err(|_| format!("'{s}' is not a number"))?;
    if n < min || n > max {
        return Err(format!("{n} is outside {min}-{max}"));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let next = next_run_from_cron("0 * * * *", at(2026, 2, 22, 10, 30, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 11, 0, 0));
    }

    #[test]
    fn test_daily_at_two() {
        let next = next_run_from_cron("0 2 * * *", at(2026, 2, 22, 7, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 2, 0, 0));
        // Strictly after: exactly on the slot moves to the next day.
        let next = next_run_from_cron("0 2 * * *", at(2026, 2, 23, 2, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 24, 2, 0, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        let next = next_run_from_cron("*/15 * * * *", at(2026, 2, 22, 10, 2, 0)).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn test_ranges_lists_and_steps() {
        // Weekdays at 09:30 and 17:30.
        let cron = CronSchedule::parse("30 9,17 * * 1-5").unwrap();
        // 2026-02-21 is a Saturday.
        assert_eq!(cron.next_after(at(2026, 2, 21, 12, 0, 0)), Some(at(2026, 2, 23, 9, 30, 0)));
        assert_eq!(cron.next_after(at(2026, 2, 23, 9, 30, 0)), Some(at(2026, 2, 23, 17, 30, 0)));

        let cron = CronSchedule::parse("0 8-18/4 * * *").unwrap();
        assert_eq!(cron.next_after(at(2026, 2, 22, 12, 0, 0)), Some(at(2026, 2, 22, 16, 0, 0)));
    }

    #[test]
    fn test_month_and_day_of_month() {
        // Quarterly filing: 1st of Jan/Apr/Jul/Oct at 06:00.
        let cron = CronSchedule::parse("0 6 1 1,4,7,10 *").unwrap();
        assert_eq!(cron.next_after(at(2026, 2, 22, 0, 0, 0)), Some(at(2026, 4, 1, 6, 0, 0)));
        assert_eq!(cron.next_after(at(2026, 12, 5, 0, 0, 0)), Some(at(2027, 1, 1, 6, 0, 0)));
    }

    #[test]
    fn test_sunday_aliases_and_leap_day() {
        let seven = CronSchedule::parse("0 0 * * 7").unwrap();
        let zero = CronSchedule::parse("0 0 * * 0").unwrap();
        let after = at(2026, 2, 18, 0, 0, 0);
        assert_eq!(seven.next_after(after), zero.next_after(after));
        assert_eq!(seven.next_after(after), Some(at(2026, 2, 22, 0, 0, 0)));

        let leap = CronSchedule::parse("0 0 29 2 *").unwrap();
        assert_eq!(leap.next_after(after), Some(at(2028, 2, 29, 0, 0, 0)));
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["bad", "* * * *", "60 * * * *", "*/0 * * * *", "5-1 * * * *", "0 24 * * *", "0 0 0 * *", "a b c d e", "1,,2 * * * *"] {
            assert!(CronSchedule::parse(bad).is_err(), "{bad}");
        }
        assert!(next_run_from_cron("bad", Utc::now()).is_none());
    }

    #[test]
    fn test_dates_that_never_occur_are_rejected() {
        for never in ["0 0 31 2 *", "0 0 30,31 2 *", "0 0 31 4,6,9,11 *"] {
            let err = CronSchedule::parse(never).unwrap_err();
            assert!(matches!(err, ComplyError::Validation(_)), "{never}");
        }
        // A weekday restriction can always match.
        assert!(CronSchedule::parse("0 0 31 2 1").is_ok());
        assert!(CronSchedule::parse("0 0 31 1-3 *").is_ok());
    }
}
