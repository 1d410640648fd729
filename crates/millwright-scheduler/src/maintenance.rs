//! Recurring maintenance windows.
//!
//! A window is a time-of-day range, optionally restricted to weekdays
//! (0 = Monday .. 6 = Sunday). `start > end` means the window crosses midnight.
//! Both bounds are inclusive.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use millwright_core::config::MaintenanceWindowConfig;
use millwright_core::error::{MillwrightError, Result};

/// Days scanned past `after` when looking for the next window start.
const LOOKAHEAD_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    /// Empty = every day.
    pub days_of_week: BTreeSet<u8>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl MaintenanceWindow {
    pub fn new(
        days_of_week: impl IntoIterator<Item = u8>,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Self> {
        let days_of_week: BTreeSet<u8> = days_of_week.into_iter().collect();
        if let Some(bad) = days_of_week.iter().find(|d| **d > 6) {
            return Err(MillwrightError::validation(format!(
                "maintenance window day {bad} out of range 0-6"
            )));
        }
        Ok(Self {
            days_of_week,
            start,
            end,
        })
    }

    pub fn every_day(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            days_of_week: BTreeSet::new(),
            start,
            end,
        }
    }

    /// Build from config strings (`"HH:MM"` or `"HH:MM:SS"`).
    pub fn from_config(config: &MaintenanceWindowConfig) -> Result<Self> {
        Self::new(
            config.days_of_week.iter().copied(),
            parse_time_of_day(&config.start)?,
            parse_time_of_day(&config.end)?,
        )
    }

    pub fn is_overnight(&self) -> bool {
        self.start > self.end
    }

    fn applies_on(&self, weekday: Weekday) -> bool {
        self.days_of_week.is_empty()
            || self
                .days_of_week
                .contains(&(weekday.num_days_from_monday() as u8))
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        if !self.applies_on(t.weekday()) {
            return false;
        }
        let tod = t.time();
        if self.is_overnight() {
            tod >= self.start || tod <= self.end
        } else {
            self.start <= tod && tod <= self.end
        }
    }
}

pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
        .map_err(|_| MillwrightError::validation(format!("invalid time of day '{s}' (want HH:MM)")))
}

/// Current and upcoming maintenance state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceStatus {
    pub in_window: bool,
    pub next_start: Option<DateTime<Utc>>,
    pub windows: usize,
}

/// Evaluates a set of windows.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceCalendar {
    windows: Vec<MaintenanceWindow>,
}

impl MaintenanceCalendar {
    pub fn new(windows: Vec<MaintenanceWindow>) -> Self {
        Self { windows }
    }

    pub fn windows(&self) -> &[MaintenanceWindow] {
        &self.windows
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn in_window(&self, t: DateTime<Utc>) -> bool {
        self.windows.iter().any(|w| w.contains(t))
    }

    /// Earliest window start strictly after `after`, looking a week ahead.
    /// `None` when no windows are configured or none start within the lookahead.
    pub fn next_window_start(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let first_day = after.date_naive();
        (0..=LOOKAHEAD_DAYS)
            .filter_map(|offset| first_day.checked_add_signed(Duration::days(offset)))
            .flat_map(|date| {
                self.windows
                    .iter()
                    .filter(move |w| w.applies_on(date.weekday()))
                    .map(move |w| date.and_time(w.start).and_utc())
            })
            .filter(|candidate| *candidate > after)
            .min()
    }

    pub fn status(&self, now: DateTime<Utc>) -> MaintenanceStatus {
        MaintenanceStatus {
            in_window: self.in_window(now),
            next_start: self.next_window_start(now),
            windows: self.windows.len(),
        }
    }
}
