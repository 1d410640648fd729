//! Cron schedules with named fields.
//! Supports per field: `*`, `N`, `N,M,...`, `A-B`, `*/N`, `A-B/N`.
//! Fields: minute, hour, day_of_week (0 = Sunday, 7 also Sunday),
//! day_of_month, month_of_year.
//!
//! Every non-wildcard field must match (day-of-month and day-of-week are ANDed).

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use millwright_core::error::{MillwrightError, Result};

/// One full Gregorian cycle. If nothing matches within it, nothing ever will.
const MAX_SCAN_DAYS: u32 = 146_097;

/// Cron schedule as configured: each field `"*"` or an explicit value/list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CronSpec {
    #[serde(default = "wildcard")]
    pub minute: String,
    #[serde(default = "wildcard")]
    pub hour: String,
    #[serde(default = "wildcard")]
    pub day_of_week: String,
    #[serde(default = "wildcard")]
    pub day_of_month: String,
    #[serde(default = "wildcard")]
    pub month_of_year: String,
}

fn wildcard() -> String {
    "*".to_string()
}

impl Default for CronSpec {
    fn default() -> Self {
        Self {
            minute: wildcard(),
            hour: wildcard(),
            day_of_week: wildcard(),
            day_of_month: wildcard(),
            month_of_year: wildcard(),
        }
    }
}

impl CronSpec {
    /// Every day at `hour:minute`.
    pub fn daily(hour: u32, minute: u32) -> Self {
        Self {
            minute: minute.to_string(),
            hour: hour.to_string(),
            ..Self::default()
        }
    }

    /// Every week on `day_of_week` (0 = Sunday) at `hour:minute`.
    pub fn weekly(day_of_week: u32, hour: u32, minute: u32) -> Self {
        Self {
            day_of_week: day_of_week.to_string(),
            ..Self::daily(hour, minute)
        }
    }

    /// Every month on `day_of_month` at `hour:minute`.
    pub fn monthly(day_of_month: u32, hour: u32, minute: u32) -> Self {
        Self {
            day_of_month: day_of_month.to_string(),
            ..Self::daily(hour, minute)
        }
    }

    /// Parse a classic 5-field expression: "MIN HOUR DOM MON DOW".
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(MillwrightError::validation(format!(
                "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }
        let spec = Self {
            minute: parts[0].to_string(),
            hour: parts[1].to_string(),
            day_of_month: parts[2].to_string(),
            month_of_year: parts[3].to_string(),
            day_of_week: parts[4].to_string(),
        };
        spec.compile()?;
        Ok(spec)
    }

    /// Classic 5-field rendering, the form handed to the broker's beat table.
    pub fn expression(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month_of_year, self.day_of_week
        )
    }

    /// Validate every field and expand it into explicit value sets.
    pub fn compile(&self) -> Result<CronSchedule> {
        Ok(CronSchedule {
            minutes: CronField::parse("minute", &self.minute, 0, 59)?,
            hours: CronField::parse("hour", &self.hour, 0, 23)?,
            days_of_week: CronField::parse_day_of_week(&self.day_of_week)?,
            days_of_month: CronField::parse("day_of_month", &self.day_of_month, 1, 31)?,
            months: CronField::parse("month_of_year", &self.month_of_year, 1, 12)?,
        })
    }
}

/// A single expanded field: sorted, de-duplicated values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    values: Vec<u32>,
    any: bool,
}

impl CronField {
    fn parse(name: &str, field: &str, min: u32, max: u32) -> Result<Self> {
        let field = field.trim();
        if field.is_empty() {
            return Err(MillwrightError::validation(format!("{name}: empty field")));
        }
        if field == "*" {
            return Ok(Self {
                values: (min..=max).collect(),
                any: true,
            });
        }

        let mut values = Vec::new();
        for part in field.split(',') {
            values.extend(parse_part(name, part.trim(), min, max)?);
        }
        values.sort_unstable();
        values.dedup();
        Ok(Self { values, any: false })
    }

    /// Day of week accepts 0..=7 where both 0 and 7 mean Sunday.
    fn parse_day_of_week(field: &str) -> Result<Self> {
        let mut parsed = Self::parse("day_of_week", field, 0, 7)?;
        if parsed.any {
            parsed.values.retain(|v| *v != 7);
            return Ok(parsed);
        }
        for v in parsed.values.iter_mut() {
            if *v == 7 {
                *v = 0;
            }
        }
        parsed.values.sort_unstable();
        parsed.values.dedup();
        Ok(parsed)
    }

    fn matches(&self, value: u32) -> bool {
        self.values.binary_search(&value).is_ok()
    }

    /// Smallest value `>= from`.
    fn first_at_or_after(&self, from: u32) -> Option<u32> {
        self.values.iter().copied().find(|v| *v >= from)
    }
}

fn parse_part(name: &str, part: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    let invalid = || MillwrightError::validation(format!("{name}: invalid value '{part}'"));
    let out_of_range =
        |v: u32| MillwrightError::validation(format!("{name}: {v} out of range {min}-{max}"));

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| invalid())?;
            if step == 0 {
                return Err(MillwrightError::validation(format!("{name}: step must be >= 1")));
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        let a: u32 = a.parse().map_err(|_| invalid())?;
        let b: u32 = b.parse().map_err(|_| invalid())?;
        if a > b {
            return Err(MillwrightError::validation(format!(
                "{name}: inverted range '{part}'"
            )));
        }
        (a, b)
    } else {
        let v: u32 = range.parse().map_err(|_| invalid())?;
        if step != 1 {
            // "N/S" reads as "from N to max every S"
            (v, max)
        } else {
            (v, v)
        }
    };

    if start < min || start > max {
        return Err(out_of_range(start));
    }
    if end > max {
        return Err(out_of_range(end));
    }
    Ok((start..=end).step_by(step as usize).collect())
}

/// A validated cron schedule ready for evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: CronField,
    hours: CronField,
    days_of_week: CronField,
    days_of_month: CronField,
    months: CronField,
}

impl CronSchedule {
    /// Whether `time` (to the minute) satisfies every field.
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.minutes.matches(time.minute())
            && self.hours.matches(time.hour())
            && self.day_matches(time.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        self.months.matches(date.month())
            && self.days_of_month.matches(date.day())
            && self
                .days_of_week
                .matches(date.weekday().num_days_from_sunday())
    }

    /// Earliest minute strictly after `after` that satisfies every field.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let truncated = after.with_second(0)?.with_nanosecond(0)?;
        let start = truncated + Duration::minutes(1);
        let first_day = start.date_naive();

        let mut date = first_day;
        for _ in 0..MAX_SCAN_DAYS {
            if !self.months.matches(date.month()) {
                // Jump straight to the first day of the next month.
                date = first_of_next_month(date)?;
                continue;
            }
            if self.day_matches(date) {
                let (min_hour, min_minute) = if date == first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for &hour in self.hours.values.iter().filter(|h| **h >= min_hour) {
                    let from = if hour == min_hour { min_minute } else { 0 };
                    if let Some(minute) = self.minutes.first_at_or_after(from) {
                        return Some(date.and_hms_opt(hour, minute, 0)?.and_utc());
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_after_time_rolls_to_next_day() {
        let schedule = CronSpec::daily(6, 0).compile().unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 8, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 11, 6, 0));
    }

    #[test]
    fn test_daily_before_time_same_day() {
        let schedule = CronSpec::daily(6, 0).compile().unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 5, 59)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 6, 0));
    }

    #[test]
    fn test_strictly_after_now() {
        let schedule = CronSpec::daily(6, 0).compile().unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 6, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 11, 6, 0));

        let every_minute = CronSpec::default().compile().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 45).unwrap();
        assert_eq!(every_minute.next_after(now).unwrap(), at(2026, 3, 10, 6, 1));
    }

    #[test]
    fn test_every_15_minutes() {
        let schedule = CronSpec::parse("*/15 * * * *").unwrap().compile().unwrap();
        let next = schedule.next_after(at(2026, 2, 22, 10, 2)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 10, 15));
        let next = schedule.next_after(at(2026, 2, 22, 23, 50)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 0, 0));
    }

    #[test]
    fn test_weekly_monday() {
        // 2026-03-10 is a Tuesday
        let schedule = CronSpec::weekly(1, 9, 30).compile().unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 12, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 16, 9, 30));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_sunday_as_seven() {
        let spec = CronSpec {
            day_of_week: "7".into(),
            ..CronSpec::daily(0, 0)
        };
        let next = spec.compile().unwrap().next_after(at(2026, 3, 10, 0, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_monthly_skips_short_months() {
        let schedule = CronSpec::monthly(31, 0, 0).compile().unwrap();
        let next = schedule.next_after(at(2026, 4, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 5, 31, 0, 0));
    }

    #[test]
    fn test_month_and_list_fields() {
        let spec = CronSpec {
            minute: "0,30".into(),
            hour: "8-9".into(),
            month_of_year: "12".into(),
            ..CronSpec::default()
        };
        let schedule = spec.compile().unwrap();
        let next = schedule.next_after(at(2026, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 12, 1, 8, 0));
        let next = schedule.next_after(next).unwrap();
        assert_eq!(next, at(2026, 12, 1, 8, 30));
        let next = schedule.next_after(at(2026, 12, 1, 9, 30)).unwrap();
        assert_eq!(next, at(2026, 12, 2, 8, 0));
    }

    #[test]
    fn test_leap_day() {
        let spec = CronSpec {
            day_of_month: "29".into(),
            month_of_year: "2".into(),
            ..CronSpec::daily(12, 0)
        };
        let next = spec.compile().unwrap().next_after(at(2026, 1, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2028, 2, 29, 12, 0));
    }

    #[test]
    fn test_leap_day_on_monday_is_decades_out() {
        let spec = CronSpec {
            day_of_month: "29".into(),
            month_of_year: "2".into(),
            day_of_week: "1".into(),
            ..CronSpec::daily(12, 0)
        };
        let next = spec.compile().unwrap().next_after(at(2026, 1, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2044, 2, 29, 12, 0));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_impossible_date_never_fires() {
        let spec = CronSpec {
            day_of_month: "30".into(),
            month_of_year: "2".into(),
            ..CronSpec::daily(0, 0)
        };
        assert!(spec.compile().unwrap().next_after(at(2026, 1, 1, 0, 0)).is_none());
    }

    #[test]
    fn test_result_satisfies_every_field() {
        let spec = CronSpec {
            minute: "5,35".into(),
            hour: "*/6".into(),
            day_of_week: "1-5".into(),
            day_of_month: "*".into(),
            month_of_year: "1,6,11".into(),
        };
        let schedule = spec.compile().unwrap();
        let mut now = at(2026, 2, 14, 17, 3);
        for _ in 0..50 {
            let next = schedule.next_after(now).unwrap();
            assert!(next > now);
            assert!(schedule.matches(&next));
            assert!([5, 35].contains(&next.minute()));
            assert_eq!(next.hour() % 6, 0);
            assert!(next.weekday().num_days_from_sunday() >= 1);
            assert!(next.weekday().num_days_from_sunday() <= 5);
            now = next;
        }
    }

    #[test]
    fn test_invalid_fields() {
        assert!(CronSpec::parse("bad").is_err());
        assert!(CronSpec::parse("60 * * * *").is_err());
        assert!(CronSpec::parse("* 24 * * *").is_err());
        assert!(CronSpec::parse("* * 0 * *").is_err());
        assert!(CronSpec::parse("* * * 13 *").is_err());
        assert!(CronSpec::parse("* * * * 8").is_err());
        assert!(CronSpec::parse("*/0 * * * *").is_err());
        assert!(CronSpec::parse("5-1 * * * *").is_err());
        assert!(CronSpec::parse("a * * * *").is_err());
        let empty = CronSpec {
            hour: " ".into(),
            ..CronSpec::default()
        };
        assert!(empty.compile().is_err());
    }

    #[test]
    fn test_expression_roundtrip() {
        let spec = CronSpec::parse("0 8 1 * 1-5").unwrap();
        assert_eq!(spec.day_of_month, "1");
        assert_eq!(spec.day_of_week, "1-5");
        assert_eq!(spec.expression(), "0 8 1 * 1-5");
    }
}
